//! Error types for the id allocation service.
//!
//! This module defines the central `Error` enum returned by request handlers.
//! It implements `From<Error>` for `tonic::Status` so failures reach clients
//! with a status code that tells them whether to retry, fix their request, or
//! page an operator.
//!
//! ## Error Cases
//! - `Allocation`: the allocator failed (via the `idalloc` registry).
//! - `InvalidRequest`: the client request was malformed or exceeded bounds.
//! - `Timeout`: allocation did not finish within the request deadline.
//! - `TaskFailed`: the blocking allocation task panicked or was aborted.
//! - `ServiceShutdown`: a request arrived while the service was shutting down.

use core::time::Duration;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the id allocation service.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The allocator rejected or failed the request.
    #[error("Allocation error: {0}")]
    Allocation(#[from] idalloc::Error),

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Allocation outlasted the request deadline.
    #[error("Allocation timed out after {0:?}")]
    Timeout(Duration),

    /// The blocking task running the allocation did not complete.
    #[error("Allocation task failed: {context}")]
    TaskFailed { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Allocation(e) => allocation_status(e),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::Timeout(waited) => {
                Status::deadline_exceeded(format!("Allocation timed out after {:?}", waited))
            }
            Error::TaskFailed { context } => {
                Status::internal(format!("Allocation task failed: {}", context))
            }
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

fn allocation_status(err: idalloc::Error) -> Status {
    use idalloc::Error as E;

    let message = err.to_string();
    match err {
        E::StoreUnavailable { .. } => Status::unavailable(message),
        E::RefillContended { .. } => Status::aborted(message),
        E::SequenceNotFound { .. } | E::RowMissing { .. } | E::UnknownIdentifier { .. } => {
            Status::not_found(message)
        }
        E::SequenceExhausted { .. } | E::OutOfRange { .. } => Status::resource_exhausted(message),
        E::MultipleRows { .. } => Status::data_loss(message),
        E::InsertFailed { .. } | E::InvalidConfig { .. } => Status::failed_precondition(message),
        _ => Status::internal(message),
    }
}
