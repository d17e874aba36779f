use crate::error::{Result, Scheme};

/// Produces unique ids for one identifier.
///
/// Implementations are shared across threads and serialize access to their
/// cached range internally; cross-process uniqueness comes from the backing
/// store alone.
pub trait IdAllocator: Send + Sync {
    /// The sequence name or counter identifier this allocator serves.
    fn identifier(&self) -> &str;

    /// The scheme persisting this allocator's state.
    fn scheme(&self) -> Scheme;

    /// Returns the next id, refilling from the store when the cached range
    /// is spent.
    ///
    /// Steady-state calls perform no I/O. A refill blocks the caller (and any
    /// other caller of this allocator) for one store round trip.
    ///
    /// # Errors
    ///
    /// See [`Error`](crate::Error). Nothing is cached when a refill fails, so
    /// retryable errors may be retried by calling again.
    fn try_next_id(&self) -> Result<i64>;

    /// Returns `count` ids in issue order.
    ///
    /// # Errors
    ///
    /// Fails with the first error [`IdAllocator::try_next_id`] reports; ids
    /// drawn before the failure are discarded, never reissued.
    fn try_next_ids(&self, count: usize) -> Result<Vec<i64>> {
        (0..count).map(|_| self.try_next_id()).collect()
    }
}
