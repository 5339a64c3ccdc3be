/// Determines what happens when a pool or store is dropped while it still has contents
/// handed out to callers (allocated blocks or tracked vertices).
///
/// By default, dropping such a container is allowed and only logged.
///
/// # Examples
///
/// ```
/// use block_pool::{DropPolicy, GrowablePool};
///
/// let pool = GrowablePool::builder()
///     .block_layout_of::<u64>()
///     .drop_policy(DropPolicy::MustNotDropContents)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The container may be dropped with outstanding contents. The memory is returned to the
    /// process regardless and a warning is logged. This is the default.
    #[default]
    MayDropContents,

    /// The container will panic if it still has outstanding contents when it is dropped.
    ///
    /// This is valuable when outstanding blocks are known to be referenced from unsafe code,
    /// so that dropping the container early would leave those references dangling.
    MustNotDropContents,
}
