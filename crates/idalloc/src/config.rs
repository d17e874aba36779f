//! Binding of identifiers to allocation schemes.
//!
//! A [`RegistryConfig`] maps every identifier a service allocates for to
//! exactly one [`SchemeConfig`]. The binding is permanent: the block and
//! Hi-Lo schemes persist different state, so moving a counter from one to the
//! other would reissue identifiers.
//!
//! With the `serde` feature the whole tree deserializes from a document such
//! as:
//!
//! ```json
//! {
//!   "lock_timeout_ms": 2000,
//!   "sequences": {
//!     "resource_id_seq": { "scheme": "block" },
//!     "scorecard_id_seq": { "scheme": "block", "refill": "unconditioned", "limit": 1000000 },
//!     "review": {
//!       "scheme": "hi_lo",
//!       "table": "id_hilo",
//!       "key_column": "table_name",
//!       "high_column": "next_hi",
//!       "max_lo": 100,
//!       "max_hi": 1000000000,
//!       "auto_init": true
//!     }
//!   }
//! }
//! ```

use core::time::Duration;
use std::collections::BTreeMap;

use crate::{
    error::{Error, Result, Scheme},
    store::HiLoTable,
};

/// Default bound on compare-and-set refill attempts per call.
pub const DEFAULT_MAX_REFILL_ATTEMPTS: u32 = 16;

/// How a block refill writes the new `next_block_start`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RefillMode {
    /// Condition the update on the value the refill read and retry the whole
    /// refill when another writer got there first. Safe with any number of
    /// processes sharing the row.
    #[default]
    CompareAndSet,
    /// Overwrite `next_block_start` filtered only by name. Two processes
    /// refilling at once can reserve the same range, so this is only correct
    /// when a single process writes the sequence.
    Unconditioned,
}

/// Parameters of a block-reservation allocator.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BlockConfig {
    pub refill: RefillMode,
    /// Exclusive ceiling on issued ids. Reaching it retires the sequence.
    pub limit: Option<i64>,
    pub max_refill_attempts: u32,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            refill: RefillMode::default(),
            limit: None,
            max_refill_attempts: DEFAULT_MAX_REFILL_ATTEMPTS,
        }
    }
}

impl BlockConfig {
    #[must_use]
    pub fn with_refill(mut self, refill: RefillMode) -> Self {
        self.refill = refill;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the limit is not positive or no
    /// refill attempt is allowed.
    pub fn validate(&self, identifier: &str) -> Result<()> {
        if self.max_refill_attempts == 0 {
            return Err(Error::invalid_config(format!(
                "`{identifier}`: max_refill_attempts must be at least 1"
            )));
        }
        if matches!(self.limit, Some(limit) if limit <= 0) {
            return Err(Error::invalid_config(format!(
                "`{identifier}`: limit must be positive"
            )));
        }
        Ok(())
    }
}

/// Parameters of a Hi-Lo allocator.
///
/// Issued ids are `high * max_lo + low` with `0 <= high < max_hi` and
/// `0 <= low < max_lo`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HiLoConfig {
    pub table: String,
    pub key_column: String,
    pub high_column: String,
    /// Key column value of the counter row. Defaults to the identifier.
    #[cfg_attr(feature = "serde", serde(default))]
    pub key: Option<String>,
    pub max_lo: i64,
    pub max_hi: i64,
    /// Create the counter row on first use instead of requiring a seed.
    #[cfg_attr(feature = "serde", serde(default))]
    pub auto_init: bool,
}

impl HiLoConfig {
    pub fn new(table: HiLoTable, max_lo: i64, max_hi: i64) -> Self {
        Self {
            table: table.table,
            key_column: table.key_column,
            high_column: table.high_column,
            key: None,
            max_lo,
            max_hi,
            auto_init: false,
        }
    }

    #[must_use]
    pub fn with_auto_init(mut self, auto_init: bool) -> Self {
        self.auto_init = auto_init;
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn hilo_table(&self) -> HiLoTable {
        HiLoTable::new(&self.table, &self.key_column, &self.high_column)
    }

    /// The counter row key used for `identifier`.
    pub fn key_for<'a>(&'a self, identifier: &'a str) -> &'a str {
        self.key.as_deref().unwrap_or(identifier)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a bound is not positive, if
    /// `max_hi * max_lo` does not fit in an `i64`, or if a table or column
    /// name is not a plain SQL identifier.
    pub fn validate(&self, identifier: &str) -> Result<()> {
        if self.max_lo < 1 || self.max_hi < 1 {
            return Err(Error::invalid_config(format!(
                "`{identifier}`: max_lo and max_hi must be at least 1"
            )));
        }
        if self.max_hi.checked_mul(self.max_lo).is_none() {
            return Err(Error::invalid_config(format!(
                "`{identifier}`: max_hi * max_lo overflows i64"
            )));
        }
        self.hilo_table().validate()
    }
}

/// The scheme an identifier is bound to, with its parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "scheme", rename_all = "snake_case"))]
pub enum SchemeConfig {
    Block(BlockConfig),
    HiLo(HiLoConfig),
}

impl SchemeConfig {
    pub fn scheme(&self) -> Scheme {
        match self {
            Self::Block(_) => Scheme::Block,
            Self::HiLo(_) => Scheme::HiLo,
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the parameters are unusable.
    pub fn validate(&self, identifier: &str) -> Result<()> {
        match self {
            Self::Block(config) => config.validate(identifier),
            Self::HiLo(config) => config.validate(identifier),
        }
    }
}

/// Everything an [`IdRegistry`] needs besides its backend.
///
/// [`IdRegistry`]: crate::IdRegistry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegistryConfig {
    /// How long a caller waits for another caller's in-flight refill before
    /// failing with a retryable error. `None` waits indefinitely; zero is
    /// rejected.
    #[cfg_attr(feature = "serde", serde(default))]
    pub lock_timeout_ms: Option<u64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub sequences: BTreeMap<String, SchemeConfig>,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_block(mut self, identifier: impl Into<String>, config: BlockConfig) -> Self {
        self.sequences
            .insert(identifier.into(), SchemeConfig::Block(config));
        self
    }

    #[must_use]
    pub fn with_hilo(mut self, identifier: impl Into<String>, config: HiLoConfig) -> Self {
        self.sequences
            .insert(identifier.into(), SchemeConfig::HiLo(config));
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Validates every binding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for the first unusable binding.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == Some(0) {
            return Err(Error::invalid_config(
                "lock_timeout_ms must be greater than 0",
            ));
        }
        for (identifier, config) in &self.sequences {
            if identifier.is_empty() {
                return Err(Error::invalid_config("identifiers must not be empty"));
            }
            config.validate(identifier)?;
        }
        Ok(())
    }
}
