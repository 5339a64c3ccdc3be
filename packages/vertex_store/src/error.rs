use thiserror::Error;

/// Errors that can occur when a vertex store starts tracking a vertex.
///
/// Tracking the same address twice or removing a vertex the store does not track are contract
/// violations and panic instead of being reported through this type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The internal pool of vertex descriptors could not grow.
    #[error(transparent)]
    Pool(#[from] block_pool::Error),
}

/// A specialized `Result` type for vertex store operations.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, std::fmt::Debug, std::error::Error);

    #[test]
    fn pool_error_message_is_passed_through() {
        let inner = block_pool::Error::OutOfMemory {
            bytes: 4096,
            align: 8,
        };
        let inner_message = inner.to_string();

        let error = Error::from(inner);

        assert_eq!(error.to_string(), inner_message);
        assert!(matches!(
            error,
            Error::Pool(block_pool::Error::OutOfMemory { bytes: 4096, .. })
        ));
    }
}
