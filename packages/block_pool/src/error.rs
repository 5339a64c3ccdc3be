use thiserror::Error;

/// Errors that can occur when a pool reserves memory from the process allocator.
///
/// Misuse of a pool (releasing foreign blocks, exceeding the block count ceiling and similar
/// contract violations) is not reported through this type - such misuse panics.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The process allocator could not supply the memory needed for a new slab.
    #[error("out of memory: failed to reserve {bytes} bytes with alignment {align} for a block slab")]
    OutOfMemory {
        /// Total size of the slab that could not be reserved.
        bytes: usize,

        /// Alignment requested for the slab.
        align: usize,
    },
}

/// A specialized `Result` type for block pool operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn out_of_memory_mentions_requested_size() {
        let error = Error::OutOfMemory {
            bytes: 4096,
            align: 8,
        };

        let message = error.to_string();
        assert!(message.contains("4096"));
        assert!(message.contains("alignment 8"));
    }
}
