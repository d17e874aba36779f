use std::sync::Arc;

use crate::{
    error::Result,
    store::{HiLoStore, HiLoTable, SequenceStore, SqlExecutor, SqlHiLoStore, SqlSequenceStore},
};

/// Hands out the stores a registry builds its allocators on.
///
/// A backend stands for one database. Everything that shares a backend
/// (or, for SQL, the database behind it) shares the persisted counters.
pub trait Backend: Send + Sync {
    /// The store holding every block-scheme sequence row.
    fn sequence_store(&self) -> Arc<dyn SequenceStore>;

    /// A store for the Hi-Lo counters in `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the table description is unusable.
    ///
    /// [`Error::InvalidConfig`]: crate::Error::InvalidConfig
    fn hilo_store(&self, table: &HiLoTable) -> Result<Arc<dyn HiLoStore>>;
}

/// A [`Backend`] issuing SQL through one shared [`SqlExecutor`].
pub struct SqlBackend<E> {
    executor: Arc<E>,
    sequences: Arc<dyn SequenceStore>,
}

impl<E: SqlExecutor + 'static> SqlBackend<E> {
    /// Creates a backend whose sequence rows live in `sequence_table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `sequence_table` is not a plain SQL
    /// identifier.
    ///
    /// [`Error::InvalidConfig`]: crate::Error::InvalidConfig
    pub fn new(executor: E, sequence_table: &str) -> Result<Self> {
        let executor = Arc::new(executor);
        let sequences = SqlSequenceStore::new(Arc::clone(&executor), sequence_table)?;
        Ok(Self {
            executor,
            sequences: Arc::new(sequences),
        })
    }

    /// The executor statements run through.
    pub fn executor(&self) -> &E {
        &self.executor
    }
}

impl<E: SqlExecutor + 'static> Backend for SqlBackend<E> {
    fn sequence_store(&self) -> Arc<dyn SequenceStore> {
        Arc::clone(&self.sequences)
    }

    fn hilo_store(&self, table: &HiLoTable) -> Result<Arc<dyn HiLoStore>> {
        let store = SqlHiLoStore::new(Arc::clone(&self.executor), table.clone())?;
        Ok(Arc::new(store))
    }
}
