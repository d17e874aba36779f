mod block;
mod hilo;
mod interface;
mod mutex;
#[cfg(test)]
mod tests;

pub use block::*;
pub use hilo::*;
pub use interface::*;
pub use mutex::*;
