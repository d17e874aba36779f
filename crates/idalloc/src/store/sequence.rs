use crate::{
    error::{Error, Result, Scheme},
    store::{SqlExecutor, Value, validate_identifier},
};

/// Default name of the table holding block-scheme sequence rows.
pub const DEFAULT_SEQUENCE_TABLE: &str = "id_sequence";

/// The persisted parameters of one sequence as read by a refill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceBlock {
    /// Lower bound of the next unreserved block.
    pub next_block_start: i64,
    /// Reservation granularity.
    pub block_size: i64,
    /// Set once no further blocks can be issued. Never reset.
    pub exhausted: bool,
}

/// Persistence access for the block-reservation scheme.
///
/// One row per sequence name with the columns `name`, `next_block_start`,
/// `block_size` and `exhausted`. Rows are seeded by deployment tooling, never
/// created or deleted here. Each operation is a single statement; nothing
/// spans a read and a write.
pub trait SequenceStore: Send + Sync {
    /// Reads the row for `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::SequenceNotFound`] if no row matches.
    /// - [`Error::MultipleRows`] if more than one row matches.
    /// - [`Error::StoreUnavailable`] if the statement fails.
    fn read_block(&self, name: &str) -> Result<SequenceBlock>;

    /// Sets `next_block_start` for `name` regardless of its current value and
    /// returns the rows affected (expected 1).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the statement fails.
    fn advance_block(&self, name: &str, new_next_block_start: i64) -> Result<u64>;

    /// Sets `next_block_start` for `name` only while it still equals
    /// `expected`. Returns 0 when another writer moved it first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the statement fails.
    fn advance_block_from(&self, name: &str, expected: i64, new_next_block_start: i64)
    -> Result<u64>;

    /// Sets `exhausted` for `name` and returns the rows affected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the statement fails.
    fn mark_exhausted(&self, name: &str) -> Result<u64>;
}

/// A [`SequenceStore`] that issues SQL through a [`SqlExecutor`].
pub struct SqlSequenceStore<E> {
    executor: E,
    select: String,
    advance: String,
    advance_from: String,
    exhaust: String,
}

impl<E: SqlExecutor> SqlSequenceStore<E> {
    /// Creates a store over `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `table` is not a plain SQL
    /// identifier.
    pub fn new(executor: E, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            executor,
            select: format!(
                "SELECT next_block_start, block_size, exhausted FROM {table} WHERE name = ?"
            ),
            advance: format!("UPDATE {table} SET next_block_start = ? WHERE name = ?"),
            advance_from: format!(
                "UPDATE {table} SET next_block_start = ? WHERE name = ? AND next_block_start = ?"
            ),
            exhaust: format!("UPDATE {table} SET exhausted = ? WHERE name = ?"),
        })
    }

    fn update(&self, name: &str, sql: &str, params: &[Value]) -> Result<u64> {
        self.executor
            .update(sql, params)
            .map_err(|e| Error::unavailable(Scheme::Block, name, e))
    }
}

impl<E: SqlExecutor> SequenceStore for SqlSequenceStore<E> {
    fn read_block(&self, name: &str) -> Result<SequenceBlock> {
        let rows = self
            .executor
            .query(&self.select, &[name.into()])
            .map_err(|e| Error::unavailable(Scheme::Block, name, e))?;

        let row = match rows.as_slice() {
            [] => {
                return Err(Error::SequenceNotFound {
                    name: name.to_owned(),
                });
            }
            [row] => row,
            many => {
                return Err(Error::MultipleRows {
                    scheme: Scheme::Block,
                    key: name.to_owned(),
                    count: many.len() as u64,
                });
            }
        };

        let malformed = || {
            Error::invalid_config(format!(
                "sequence row `{name}` does not have the expected column types"
            ))
        };
        match row.as_slice() {
            [next, size, exhausted] => Ok(SequenceBlock {
                next_block_start: next.as_i64().ok_or_else(malformed)?,
                block_size: size.as_i64().ok_or_else(malformed)?,
                exhausted: exhausted.as_bool().ok_or_else(malformed)?,
            }),
            _ => Err(malformed()),
        }
    }

    fn advance_block(&self, name: &str, new_next_block_start: i64) -> Result<u64> {
        self.update(
            name,
            &self.advance,
            &[new_next_block_start.into(), name.into()],
        )
    }

    fn advance_block_from(
        &self,
        name: &str,
        expected: i64,
        new_next_block_start: i64,
    ) -> Result<u64> {
        self.update(
            name,
            &self.advance_from,
            &[new_next_block_start.into(), name.into(), expected.into()],
        )
    }

    fn mark_exhausted(&self, name: &str) -> Result<u64> {
        self.update(name, &self.exhaust, &[true.into(), name.into()])
    }
}
