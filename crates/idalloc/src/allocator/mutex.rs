use core::time::Duration;

pub use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, ExecError, Result, Scheme};

#[cfg(feature = "cache-padded")]
pub(crate) type StateCell<T> = crossbeam_utils::CachePadded<Mutex<T>>;
#[cfg(not(feature = "cache-padded"))]
pub(crate) type StateCell<T> = Mutex<T>;

pub(crate) fn state_cell<T>(value: T) -> StateCell<T> {
    #[cfg(feature = "cache-padded")]
    {
        crossbeam_utils::CachePadded::new(Mutex::new(value))
    }
    #[cfg(not(feature = "cache-padded"))]
    {
        Mutex::new(value)
    }
}

/// Locks an allocator's state, giving up after `timeout` if another caller's
/// refill is still in flight.
pub(crate) fn lock_state<'a, T>(
    cell: &'a StateCell<T>,
    timeout: Option<Duration>,
    scheme: Scheme,
    identifier: &str,
) -> Result<MutexGuard<'a, T>> {
    match timeout {
        None => Ok(cell.lock()),
        Some(waited) => cell
            .try_lock_for(waited)
            .ok_or_else(|| Error::unavailable(scheme, identifier, ExecError::Timeout { waited })),
    }
}
