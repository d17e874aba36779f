use crate::error::{Error, ExecError, Result};

/// A single parameter or result cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Bool(bool),
}

impl Value {
    /// Reads the cell as an integer. Booleans widen to `0`/`1`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int(v) => Some(v),
            Self::Bool(b) => Some(i64::from(b)),
            _ => None,
        }
    }

    /// Reads the cell as a flag. Integer columns are true when non-zero,
    /// which is how most engines store booleans.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(b) => Some(b),
            Self::Int(v) => Some(v != 0),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// One result row, columns in `SELECT` order.
pub type Row = Vec<Value>;

/// The generic SQL execution surface the stores are written against.
///
/// Statements use positional `?` placeholders. Each call runs in its own
/// implicit transaction; implementations do not retry, and connection
/// management stays on the implementor's side of this trait.
pub trait SqlExecutor: Send + Sync {
    /// Runs a query and returns every row.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] when the statement cannot be executed.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ExecError>;

    /// Runs a data-modifying statement and returns the rows affected.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] when the statement cannot be executed or a
    /// constraint rejects it.
    fn update(&self, sql: &str, params: &[Value]) -> Result<u64, ExecError>;

    /// Runs an update followed by a query with no other writer in between,
    /// returning the rows affected and the rows read.
    ///
    /// The provided implementation simply runs the two statements back to
    /// back, which is only sound with a single writer. Executors that can
    /// open a transaction should override it.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] if either statement fails.
    fn update_and_query(
        &self,
        update: &str,
        update_params: &[Value],
        query: &str,
        query_params: &[Value],
    ) -> Result<(u64, Vec<Row>), ExecError> {
        let affected = self.update(update, update_params)?;
        let rows = self.query(query, query_params)?;
        Ok((affected, rows))
    }
}

impl<E: SqlExecutor + ?Sized> SqlExecutor for std::sync::Arc<E> {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ExecError> {
        (**self).query(sql, params)
    }

    fn update(&self, sql: &str, params: &[Value]) -> Result<u64, ExecError> {
        (**self).update(sql, params)
    }

    fn update_and_query(
        &self,
        update: &str,
        update_params: &[Value],
        query: &str,
        query_params: &[Value],
    ) -> Result<(u64, Vec<Row>), ExecError> {
        (**self).update_and_query(update, update_params, query, query_params)
    }
}

/// Checks that a table or column name can be spliced into a statement.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, optionally dot-qualified
/// (`schema.table`).
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] for anything else.
pub fn validate_identifier(ident: &str) -> Result<()> {
    let valid = !ident.is_empty()
        && ident.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_config(format!(
            "`{ident}` is not a valid SQL identifier"
        )))
    }
}
