use core::{ops::Range, time::Duration};
use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::instrument;

use super::mutex::{StateCell, lock_state, state_cell};
use crate::{
    allocator::IdAllocator,
    config::{BlockConfig, RefillMode},
    error::{Error, Result, Scheme},
    store::SequenceStore,
};

/// The cached state of a [`BlockAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// No block is reserved; the next call refills.
    Empty,
    /// Ids `cursor..block_end` are reserved and not yet issued.
    Serving {
        /// The next id to issue.
        cursor: i64,
        /// Exclusive end of the reserved block.
        block_end: i64,
    },
    /// The sequence can never issue again in this process.
    Retired(Retirement),
}

/// Why a [`BlockAllocator`] stopped issuing ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retirement {
    /// The sequence row does not exist.
    NotFound,
    /// The sequence is flagged exhausted or reached its limit.
    Exhausted,
}

impl Retirement {
    fn from_error(err: &Error) -> Option<Self> {
        match err {
            Error::SequenceNotFound { .. } => Some(Self::NotFound),
            Error::SequenceExhausted { .. } => Some(Self::Exhausted),
            _ => None,
        }
    }
}

/// A block-reservation allocator for one named sequence.
///
/// Each refill performs one read and one write against the
/// [`SequenceStore`], reserving `[next_block_start, next_block_start +
/// block_size)`; the ids in that range are then handed out from memory. Ids
/// left in the cached block when the process stops are never issued: a new
/// allocator always starts from the persisted row.
///
/// The whole read-reserve-cache sequence runs under the allocator's lock, so
/// concurrent callers in one process never both refill. Across processes the
/// guarantee depends on [`RefillMode`].
///
/// ## Example
/// ```
/// use std::sync::Arc;
/// use idalloc::{Backend, BlockAllocator, BlockConfig, IdAllocator, MemoryBackend};
///
/// let backend = MemoryBackend::new();
/// backend.seed_sequence("resource_id_seq", 1, 100);
///
/// let allocator = BlockAllocator::new(
///     "resource_id_seq",
///     backend.sequence_store(),
///     BlockConfig::default(),
/// );
/// assert_eq!(allocator.try_next_id().unwrap(), 1);
/// assert_eq!(allocator.try_next_id().unwrap(), 2);
/// assert_eq!(backend.sequence("resource_id_seq").unwrap().next_block_start, 101);
/// ```
pub struct BlockAllocator {
    name: String,
    store: Arc<dyn SequenceStore>,
    config: BlockConfig,
    lock_timeout: Option<Duration>,
    state: StateCell<BlockState>,
}

impl BlockAllocator {
    /// Creates an allocator in the [`BlockState::Empty`] state. No I/O
    /// happens until the first id is requested.
    pub fn new(name: impl Into<String>, store: Arc<dyn SequenceStore>, config: BlockConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            lock_timeout: None,
            state: state_cell(BlockState::Empty),
        }
    }

    /// Bounds how long a caller waits for another caller's refill.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// A snapshot of the cached state.
    pub fn state(&self) -> BlockState {
        *self.state.lock()
    }

    /// Returns the next id of the sequence.
    ///
    /// # Errors
    ///
    /// - [`Error::SequenceNotFound`] / [`Error::SequenceExhausted`]: terminal.
    ///   Every later call fails the same way without touching the store.
    /// - [`Error::StoreUnavailable`]: the store failed, or another caller's
    ///   refill outlasted the lock timeout. Retryable.
    /// - [`Error::RefillContended`]: every compare-and-set attempt lost.
    ///   Retryable.
    /// - [`Error::InvalidConfig`] / [`Error::MultipleRows`]: the persisted row
    ///   is unusable.
    pub fn try_next_id(&self) -> Result<i64> {
        let mut state = lock_state(&self.state, self.lock_timeout, Scheme::Block, &self.name)?;
        loop {
            match *state {
                BlockState::Serving { cursor, block_end } if cursor < block_end => {
                    *state = BlockState::Serving {
                        cursor: cursor + 1,
                        block_end,
                    };
                    return Ok(cursor);
                }
                BlockState::Retired(reason) => return Err(self.retired(reason)),
                BlockState::Serving { .. } | BlockState::Empty => {
                    *state = BlockState::Empty;
                    match self.refill() {
                        Ok(range) => {
                            *state = BlockState::Serving {
                                cursor: range.start,
                                block_end: range.end,
                            };
                        }
                        Err(err) => {
                            if let Some(reason) = Retirement::from_error(&err) {
                                *state = BlockState::Retired(reason);
                            }
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Reserves the next block, returning the ids it covers.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self), fields(sequence = %self.name))
    )]
    fn refill(&self) -> Result<Range<i64>> {
        let ceiling = self.config.limit.unwrap_or(i64::MAX);

        for _attempt in 1..=self.config.max_refill_attempts {
            let block = self.store.read_block(&self.name)?;
            if block.exhausted {
                return Err(self.retired(Retirement::Exhausted));
            }
            if block.block_size <= 0 {
                return Err(Error::invalid_config(format!(
                    "sequence `{}` has block_size {}",
                    self.name, block.block_size
                )));
            }

            let lo = block.next_block_start;
            if lo >= ceiling {
                self.store.mark_exhausted(&self.name)?;
                #[cfg(feature = "tracing")]
                tracing::warn!(lo, ceiling, "sequence reached its limit, marked exhausted");
                return Err(self.retired(Retirement::Exhausted));
            }
            let hi = lo.saturating_add(block.block_size).min(ceiling);

            let affected = match self.config.refill {
                RefillMode::CompareAndSet => self.store.advance_block_from(&self.name, lo, hi)?,
                RefillMode::Unconditioned => self.store.advance_block(&self.name, hi)?,
            };
            match (affected, self.config.refill) {
                (1, _) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(lo, hi, attempt = _attempt, "reserved block");
                    return Ok(lo..hi);
                }
                (0, RefillMode::CompareAndSet) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(lo, attempt = _attempt, "lost refill race, rereading");
                }
                (0, RefillMode::Unconditioned) => {
                    return Err(self.retired(Retirement::NotFound));
                }
                (count, _) => {
                    return Err(Error::MultipleRows {
                        scheme: Scheme::Block,
                        key: self.name.clone(),
                        count,
                    });
                }
            }
        }

        Err(Error::RefillContended {
            name: self.name.clone(),
            attempts: self.config.max_refill_attempts,
        })
    }

    fn retired(&self, reason: Retirement) -> Error {
        let name = self.name.clone();
        match reason {
            Retirement::NotFound => Error::SequenceNotFound { name },
            Retirement::Exhausted => Error::SequenceExhausted { name },
        }
    }
}

impl IdAllocator for BlockAllocator {
    fn identifier(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> Scheme {
        Scheme::Block
    }

    fn try_next_id(&self) -> Result<i64> {
        self.try_next_id()
    }
}
