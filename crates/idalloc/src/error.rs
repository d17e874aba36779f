use core::fmt;
use core::time::Duration;

/// A result type whose error defaults to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The allocation scheme backing an identifier.
///
/// Every logical counter is permanently bound to one scheme; the two are not
/// interchangeable because they persist different state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Scheme {
    /// Contiguous block reservation against a sequence row.
    Block,
    /// A persisted high value fanned out by an in-memory low counter.
    HiLo,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::HiLo => f.write_str("hi-lo"),
        }
    }
}

/// Failures reported by a [`SqlExecutor`].
///
/// [`SqlExecutor`]: crate::SqlExecutor
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ExecError {
    /// The statement could not be executed (connection lost, I/O, bad SQL).
    #[error("statement failed: {0}")]
    Unavailable(String),

    /// The statement, or the wait for the allocator guarding it, took longer
    /// than the configured bound.
    #[error("timed out after {waited:?}")]
    Timeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// A constraint (typically the unique key) rejected the statement.
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// All errors produced while allocating identifiers.
///
/// Apart from [`Error::StoreUnavailable`] and [`Error::RefillContended`],
/// every variant is fatal for the call that produced it: retrying without
/// operator intervention cannot succeed. Use [`Error::is_retryable`] to tell
/// the two groups apart.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No sequence row exists for the name.
    #[error("sequence `{name}` not found")]
    SequenceNotFound {
        /// The sequence name.
        name: String,
    },

    /// The sequence has been retired and will never issue another block.
    #[error("sequence `{name}` is exhausted")]
    SequenceExhausted {
        /// The sequence name.
        name: String,
    },

    /// No Hi-Lo counter row exists for the key and auto-init is disabled.
    #[error("no counter row for key `{key}` in `{table}`")]
    RowMissing {
        /// The counter table.
        table: String,
        /// The key column value.
        key: String,
    },

    /// More than one row matched a key that must be unique.
    #[error("{count} rows match {scheme} key `{key}`, expected exactly one")]
    MultipleRows {
        /// The scheme whose schema invariant was violated.
        scheme: Scheme,
        /// The sequence name or counter key.
        key: String,
        /// How many rows matched.
        count: u64,
    },

    /// A fetched or derived value is outside its configured ceiling.
    #[error("value {value} for `{identifier}` is outside [0, {max})")]
    OutOfRange {
        /// The identifier being allocated.
        identifier: String,
        /// The offending value.
        value: i64,
        /// The exclusive upper bound.
        max: i64,
    },

    /// Auto-creating a missing counter row did not insert exactly one row.
    #[error("inserting counter row for key `{key}` in `{table}` affected {rows} rows")]
    InsertFailed {
        /// The counter table.
        table: String,
        /// The key column value.
        key: String,
        /// Rows reported by the insert.
        rows: u64,
    },

    /// The backing store failed or timed out. Nothing was cached, so the whole
    /// call may be retried after a backoff.
    #[error("{scheme} store unavailable for `{identifier}`: {source}")]
    StoreUnavailable {
        /// The scheme of the allocator that hit the failure.
        scheme: Scheme,
        /// The sequence name or counter key.
        identifier: String,
        /// The underlying executor failure.
        #[source]
        source: ExecError,
    },

    /// Every compare-and-set refill attempt lost to a concurrent writer.
    #[error("refill of sequence `{name}` lost {attempts} consecutive races")]
    RefillContended {
        /// The sequence name.
        name: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// No allocator is configured for the identifier.
    #[error("no allocator configured for `{identifier}`")]
    UnknownIdentifier {
        /// The requested identifier.
        identifier: String,
    },

    /// A configuration value or a persisted parameter is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },
}

impl Error {
    /// Returns `true` when retrying the whole call after a backoff may
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::RefillContended { .. }
        )
    }

    pub(crate) fn unavailable(scheme: Scheme, identifier: &str, source: ExecError) -> Self {
        Self::StoreUnavailable {
            scheme,
            identifier: identifier.to_owned(),
            source,
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
