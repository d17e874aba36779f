use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    error::{Error, ExecError, Result, Scheme},
    store::{Backend, HiLoStore, HiLoTable, SequenceBlock, SequenceStore},
};

/// A persisted block-scheme row as held by [`MemoryBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceRow {
    pub name: String,
    pub next_block_start: i64,
    pub block_size: i64,
    pub exhausted: bool,
}

#[derive(Default)]
struct Tables {
    sequences: HashMap<String, SequenceRow>,
    // Rows are kept in a list per key so a broken unique key can be modelled.
    counters: HashMap<(String, String), Vec<i64>>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl Shared {
    fn check(&self, scheme: Scheme, identifier: &str) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(Error::unavailable(
                scheme,
                identifier,
                ExecError::Unavailable("memory backend switched off".to_owned()),
            ))
        } else {
            Ok(())
        }
    }
}

/// An in-process [`Backend`].
///
/// Every operation is atomic with respect to the others, matching the
/// single-statement guarantees the SQL stores rely on. Clones share the same
/// tables, so two registries built on clones of one backend behave like two
/// processes sharing one database.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds (or replaces) a block-scheme sequence row.
    pub fn seed_sequence(&self, name: &str, next_block_start: i64, block_size: i64) {
        self.shared.tables.lock().sequences.insert(
            name.to_owned(),
            SequenceRow {
                name: name.to_owned(),
                next_block_start,
                block_size,
                exhausted: false,
            },
        );
    }

    /// Returns a copy of the row for `name`, if any.
    pub fn sequence(&self, name: &str) -> Option<SequenceRow> {
        self.shared.tables.lock().sequences.get(name).cloned()
    }

    /// Adds a Hi-Lo counter row. Calling it twice for one key leaves two rows,
    /// as a table without a unique key would.
    pub fn seed_counter(&self, table: &str, key: &str, high: i64) {
        self.shared
            .tables
            .lock()
            .counters
            .entry((table.to_owned(), key.to_owned()))
            .or_default()
            .push(high);
    }

    /// Returns the high values of every row for `key` in `table`.
    pub fn counter_rows(&self, table: &str, key: &str) -> Vec<i64> {
        self.shared
            .tables
            .lock()
            .counters
            .get(&(table.to_owned(), key.to_owned()))
            .cloned()
            .unwrap_or_default()
    }

    /// While set, every store operation fails with
    /// [`Error::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::Release);
    }
}

impl Backend for MemoryBackend {
    fn sequence_store(&self) -> Arc<dyn SequenceStore> {
        Arc::new(MemorySequenceStore {
            shared: Arc::clone(&self.shared),
        })
    }

    fn hilo_store(&self, table: &HiLoTable) -> Result<Arc<dyn HiLoStore>> {
        table.validate()?;
        Ok(Arc::new(MemoryHiLoStore {
            shared: Arc::clone(&self.shared),
            table: table.clone(),
        }))
    }
}

/// The [`SequenceStore`] of a [`MemoryBackend`].
pub struct MemorySequenceStore {
    shared: Arc<Shared>,
}

impl MemorySequenceStore {
    fn update(&self, name: &str, f: impl FnOnce(&mut SequenceRow) -> bool) -> Result<u64> {
        self.shared.check(Scheme::Block, name)?;
        let mut tables = self.shared.tables.lock();
        let Some(row) = tables.sequences.get_mut(name) else {
            return Ok(0);
        };
        Ok(u64::from(f(row)))
    }
}

impl SequenceStore for MemorySequenceStore {
    fn read_block(&self, name: &str) -> Result<SequenceBlock> {
        self.shared.check(Scheme::Block, name)?;
        let tables = self.shared.tables.lock();
        tables
            .sequences
            .get(name)
            .map(|row| SequenceBlock {
                next_block_start: row.next_block_start,
                block_size: row.block_size,
                exhausted: row.exhausted,
            })
            .ok_or_else(|| Error::SequenceNotFound {
                name: name.to_owned(),
            })
    }

    fn advance_block(&self, name: &str, new_next_block_start: i64) -> Result<u64> {
        self.update(name, |row| {
            row.next_block_start = new_next_block_start;
            true
        })
    }

    fn advance_block_from(
        &self,
        name: &str,
        expected: i64,
        new_next_block_start: i64,
    ) -> Result<u64> {
        self.update(name, |row| {
            if row.next_block_start != expected {
                return false;
            }
            row.next_block_start = new_next_block_start;
            true
        })
    }

    fn mark_exhausted(&self, name: &str) -> Result<u64> {
        self.update(name, |row| {
            row.exhausted = true;
            true
        })
    }
}

/// The [`HiLoStore`] of a [`MemoryBackend`].
pub struct MemoryHiLoStore {
    shared: Arc<Shared>,
    table: HiLoTable,
}

impl MemoryHiLoStore {
    fn key(&self, key: &str) -> (String, String) {
        (self.table.table.clone(), key.to_owned())
    }

    fn single_high(&self, key: &str, rows: Option<&Vec<i64>>) -> Result<i64> {
        match rows.map(Vec::as_slice) {
            None | Some([]) => Err(Error::RowMissing {
                table: self.table.table.clone(),
                key: key.to_owned(),
            }),
            Some([high]) => Ok(*high),
            Some(many) => Err(Error::MultipleRows {
                scheme: Scheme::HiLo,
                key: key.to_owned(),
                count: many.len() as u64,
            }),
        }
    }
}

impl HiLoStore for MemoryHiLoStore {
    fn table(&self) -> &HiLoTable {
        &self.table
    }

    fn increment_high(&self, key: &str) -> Result<u64> {
        self.shared.check(Scheme::HiLo, key)?;
        let mut tables = self.shared.tables.lock();
        let Some(rows) = tables.counters.get_mut(&self.key(key)) else {
            return Ok(0);
        };
        for high in rows.iter_mut() {
            *high += 1;
        }
        Ok(rows.len() as u64)
    }

    fn insert_initial_row(&self, key: &str) -> Result<u64> {
        self.shared.check(Scheme::HiLo, key)?;
        let mut tables = self.shared.tables.lock();
        let rows = tables.counters.entry(self.key(key)).or_default();
        if !rows.is_empty() {
            // Unique key violation.
            return Ok(0);
        }
        rows.push(0);
        Ok(1)
    }

    fn read_high(&self, key: &str) -> Result<i64> {
        self.shared.check(Scheme::HiLo, key)?;
        let tables = self.shared.tables.lock();
        self.single_high(key, tables.counters.get(&self.key(key)))
    }

    fn increment_and_read(&self, key: &str) -> Result<Option<i64>> {
        self.shared.check(Scheme::HiLo, key)?;
        let mut tables = self.shared.tables.lock();
        let Some(rows) = tables.counters.get_mut(&self.key(key)) else {
            return Ok(None);
        };
        match rows.as_mut_slice() {
            [] => Ok(None),
            [high] => {
                *high += 1;
                Ok(Some(*high))
            }
            many => {
                for high in many.iter_mut() {
                    *high += 1;
                }
                Err(Error::MultipleRows {
                    scheme: Scheme::HiLo,
                    key: key.to_owned(),
                    count: many.len() as u64,
                })
            }
        }
    }
}
