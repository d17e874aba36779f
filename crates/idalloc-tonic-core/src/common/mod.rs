//! Error types shared by the server and its clients.

pub mod error;
pub use error::{Error, Result};
