use core::time::Duration;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::instrument;

use super::mutex::{StateCell, lock_state, state_cell};
use crate::{
    allocator::IdAllocator,
    config::HiLoConfig,
    error::{Error, Result, Scheme},
    store::HiLoStore,
};

/// Fetches fresh high values from a [`HiLoStore`].
pub struct HighValueFetcher {
    store: Arc<dyn HiLoStore>,
    max_hi: i64,
    auto_init: bool,
}

impl HighValueFetcher {
    /// Creates a fetcher accepting high values in `[0, max_hi)`.
    pub fn new(store: Arc<dyn HiLoStore>, max_hi: i64, auto_init: bool) -> Self {
        Self {
            store,
            max_hi,
            auto_init,
        }
    }

    /// Claims the next high value for `key`.
    ///
    /// The increment is the only cross-process coordination: every value
    /// returned here is returned to exactly one caller. A missing row is
    /// created (with `auto_init`) and the increment retried once; nothing else
    /// is retried.
    ///
    /// # Errors
    ///
    /// - [`Error::RowMissing`] if the row does not exist and `auto_init` is
    ///   off.
    /// - [`Error::InsertFailed`] if auto-creating the row did not insert
    ///   exactly one row, typically because another caller raced the insert.
    /// - [`Error::MultipleRows`] if the key matches several rows.
    /// - [`Error::OutOfRange`] if the value is outside `[0, max_hi)`.
    /// - [`Error::StoreUnavailable`] if the store failed.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub fn next_high_value(&self, key: &str) -> Result<i64> {
        let high = match self.store.increment_and_read(key)? {
            Some(high) => high,
            None => self.create_and_claim(key)?,
        };

        if !(0..self.max_hi).contains(&high) {
            #[cfg(feature = "tracing")]
            tracing::error!(high, max_hi = self.max_hi, "high value out of range");
            return Err(Error::OutOfRange {
                identifier: key.to_owned(),
                value: high,
                max: self.max_hi,
            });
        }
        Ok(high)
    }

    #[cold]
    fn create_and_claim(&self, key: &str) -> Result<i64> {
        let table = &self.store.table().table;
        if !self.auto_init {
            return Err(Error::RowMissing {
                table: table.clone(),
                key: key.to_owned(),
            });
        }

        let rows = self.store.insert_initial_row(key)?;
        if rows != 1 {
            #[cfg(feature = "tracing")]
            tracing::warn!(rows, "auto-init insert did not create the counter row");
            return Err(Error::InsertFailed {
                table: table.clone(),
                key: key.to_owned(),
                rows,
            });
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("created counter row");

        self.store
            .increment_and_read(key)?
            .ok_or_else(|| Error::RowMissing {
                table: table.clone(),
                key: key.to_owned(),
            })
    }
}

#[derive(Clone, Copy, Debug)]
struct HiLoState {
    high: i64,
    low: i64,
}

/// A Hi-Lo allocator for one counter key.
///
/// Issues `high * max_lo + low` for `low` in `0..max_lo`, then claims a new
/// `high` from the store. Because every high value goes to a single caller,
/// the `max_lo` ids derived from it are never issued anywhere else.
///
/// ## Example
/// ```
/// use idalloc::{Backend, HiLoAllocator, HiLoConfig, HiLoTable, IdAllocator, MemoryBackend};
///
/// let table = HiLoTable::new("id_hilo", "table_name", "next_hi");
/// let backend = MemoryBackend::new();
/// backend.seed_counter("id_hilo", "review", 4);
///
/// let config = HiLoConfig::new(table.clone(), 100, 1_000);
/// let allocator =
///     HiLoAllocator::new("review", backend.hilo_store(&table).unwrap(), &config).unwrap();
///
/// assert_eq!(allocator.try_next_id().unwrap(), 500);
/// assert_eq!(allocator.try_next_id().unwrap(), 501);
/// ```
pub struct HiLoAllocator {
    identifier: String,
    key: String,
    fetcher: HighValueFetcher,
    max_lo: i64,
    lock_timeout: Option<Duration>,
    state: StateCell<HiLoState>,
}

impl HiLoAllocator {
    /// Creates an allocator that claims its first high value on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        identifier: impl Into<String>,
        store: Arc<dyn HiLoStore>,
        config: &HiLoConfig,
    ) -> Result<Self> {
        let identifier = identifier.into();
        config.validate(&identifier)?;
        Ok(Self {
            key: config.key_for(&identifier).to_owned(),
            fetcher: HighValueFetcher::new(store, config.max_hi, config.auto_init),
            max_lo: config.max_lo,
            lock_timeout: None,
            // `low == max_lo` forces a fetch before the first id.
            state: state_cell(HiLoState {
                high: 0,
                low: config.max_lo,
            }),
            identifier,
        })
    }

    /// Bounds how long a caller waits for another caller's fetch.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The counter row key this allocator increments.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the next id.
    ///
    /// # Errors
    ///
    /// Any error of [`HighValueFetcher::next_high_value`], or
    /// [`Error::StoreUnavailable`] if another caller's fetch outlasted the
    /// lock timeout. A failed fetch leaves the previous state in place.
    pub fn try_next_id(&self) -> Result<i64> {
        let mut state =
            lock_state(&self.state, self.lock_timeout, Scheme::HiLo, &self.identifier)?;

        if state.low >= self.max_lo {
            let high = self.fetcher.next_high_value(&self.key)?;
            *state = HiLoState { high, low: 0 };
        }

        let id = state
            .high
            .checked_mul(self.max_lo)
            .and_then(|base| base.checked_add(state.low))
            .ok_or_else(|| Error::OutOfRange {
                identifier: self.identifier.clone(),
                value: state.high,
                max: i64::MAX / self.max_lo,
            })?;
        state.low += 1;
        Ok(id)
    }
}

impl IdAllocator for HiLoAllocator {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn scheme(&self) -> Scheme {
        Scheme::HiLo
    }

    fn try_next_id(&self) -> Result<i64> {
        self.try_next_id()
    }
}
