use crate::{
    error::{Error, ExecError, Result, Scheme},
    store::{Row, SqlExecutor, validate_identifier},
};

/// Where a family of Hi-Lo counters lives: a caller-chosen table with a key
/// column and a high-value column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HiLoTable {
    /// The counter table.
    pub table: String,
    /// Column holding the counter key, unique per row.
    pub key_column: String,
    /// Column holding the last claimed high value.
    pub high_column: String,
}

impl HiLoTable {
    pub fn new(
        table: impl Into<String>,
        key_column: impl Into<String>,
        high_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            high_column: high_column.into(),
        }
    }

    /// Checks all three names are usable SQL identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad identifier.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.key_column)?;
        validate_identifier(&self.high_column)
    }
}

/// Persistence access for the Hi-Lo scheme, bound to one [`HiLoTable`].
///
/// Uniqueness across processes rests on [`HiLoStore::increment_and_read`]:
/// each successful increment yields a successor no other caller observes, as
/// long as the read-back sees that caller's own increment.
pub trait HiLoStore: Send + Sync {
    /// The table this store reads and writes.
    fn table(&self) -> &HiLoTable;

    /// Adds one to the high value for `key` and returns the rows affected:
    /// 0 when no row exists, 1 on success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the statement fails.
    fn increment_high(&self, key: &str) -> Result<u64>;

    /// Inserts a counter row for `key` with a high value of 0 and returns the
    /// rows affected. A unique-key violation is reported as 0 rows, meaning
    /// another caller created the row first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the statement fails for any
    /// other reason.
    fn insert_initial_row(&self, key: &str) -> Result<u64>;

    /// Reads the current high value for `key`.
    ///
    /// # Errors
    ///
    /// - [`Error::RowMissing`] if no row matches.
    /// - [`Error::MultipleRows`] if more than one row matches.
    /// - [`Error::StoreUnavailable`] if the statement fails.
    fn read_high(&self, key: &str) -> Result<i64>;

    /// Increments the high value for `key` and reads back the result.
    /// Returns `None` when no row exists.
    ///
    /// The provided implementation is [`HiLoStore::increment_high`] followed
    /// by [`HiLoStore::read_high`]. Another writer can slip in between the
    /// two, so stores shared by several processes override this to run both
    /// as one unit.
    ///
    /// # Errors
    ///
    /// - [`Error::MultipleRows`] if the increment touched more than one row.
    /// - Any error of [`HiLoStore::read_high`].
    fn increment_and_read(&self, key: &str) -> Result<Option<i64>> {
        match self.increment_high(key)? {
            0 => Ok(None),
            1 => self.read_high(key).map(Some),
            count => Err(Error::MultipleRows {
                scheme: Scheme::HiLo,
                key: key.to_owned(),
                count,
            }),
        }
    }
}

/// A [`HiLoStore`] that issues SQL through a [`SqlExecutor`].
pub struct SqlHiLoStore<E> {
    executor: E,
    table: HiLoTable,
    increment: String,
    insert: String,
    select: String,
}

impl<E: SqlExecutor> SqlHiLoStore<E> {
    /// Creates a store over `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any name in `table` is not a plain
    /// SQL identifier.
    pub fn new(executor: E, table: HiLoTable) -> Result<Self> {
        table.validate()?;
        let HiLoTable {
            table: t,
            key_column: k,
            high_column: h,
        } = &table;
        let increment = format!("UPDATE {t} SET {h} = {h} + 1 WHERE {k} = ?");
        let insert = format!("INSERT INTO {t} ({k}, {h}) VALUES (?, 0)");
        let select = format!("SELECT {h} FROM {t} WHERE {k} = ?");
        Ok(Self {
            executor,
            table,
            increment,
            insert,
            select,
        })
    }

    fn single_high(&self, key: &str, rows: &[Row]) -> Result<i64> {
        match rows {
            [] => Err(Error::RowMissing {
                table: self.table.table.clone(),
                key: key.to_owned(),
            }),
            [row] => row.first().and_then(|v| v.as_i64()).ok_or_else(|| {
                Error::invalid_config(format!(
                    "`{}.{}` for key `{key}` is not an integer",
                    self.table.table, self.table.high_column
                ))
            }),
            many => Err(Error::MultipleRows {
                scheme: Scheme::HiLo,
                key: key.to_owned(),
                count: many.len() as u64,
            }),
        }
    }
}

impl<E: SqlExecutor> HiLoStore for SqlHiLoStore<E> {
    fn table(&self) -> &HiLoTable {
        &self.table
    }

    fn increment_high(&self, key: &str) -> Result<u64> {
        self.executor
            .update(&self.increment, &[key.into()])
            .map_err(|e| Error::unavailable(Scheme::HiLo, key, e))
    }

    fn insert_initial_row(&self, key: &str) -> Result<u64> {
        match self.executor.update(&self.insert, &[key.into()]) {
            Ok(rows) => Ok(rows),
            Err(ExecError::Constraint(_)) => Ok(0),
            Err(e) => Err(Error::unavailable(Scheme::HiLo, key, e)),
        }
    }

    fn read_high(&self, key: &str) -> Result<i64> {
        let rows = self
            .executor
            .query(&self.select, &[key.into()])
            .map_err(|e| Error::unavailable(Scheme::HiLo, key, e))?;
        self.single_high(key, &rows)
    }

    fn increment_and_read(&self, key: &str) -> Result<Option<i64>> {
        let (affected, rows) = self
            .executor
            .update_and_query(&self.increment, &[key.into()], &self.select, &[key.into()])
            .map_err(|e| Error::unavailable(Scheme::HiLo, key, e))?;
        match affected {
            0 => Ok(None),
            1 => self.single_high(key, &rows).map(Some),
            count => Err(Error::MultipleRows {
                scheme: Scheme::HiLo,
                key: key.to_owned(),
                count,
            }),
        }
    }
}
