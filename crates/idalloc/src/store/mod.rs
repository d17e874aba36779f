//! Persistence access for both allocation schemes.
//!
//! Allocators never see SQL. They talk to a [`SequenceStore`] (block scheme)
//! or a [`HiLoStore`] (Hi-Lo scheme), handed out by a [`Backend`]. The SQL
//! implementations assemble their statements and run them through a
//! [`SqlExecutor`], the only seam to a real database. The memory
//! implementations keep the same tables in process for tests and embedding.

mod backend;
mod executor;
mod hilo;
mod memory;
mod sequence;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use backend::*;
pub use executor::*;
pub use hilo::*;
pub use memory::*;
pub use sequence::*;
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
#[cfg(feature = "sqlite")]
pub use sqlite::*;
