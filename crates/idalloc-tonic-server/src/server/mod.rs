//! Server-side components of the id allocation service.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration and the allocator config file.
//! - [`service`] - The gRPC service implementation.
//! - [`telemetry`] - Logging, tracing and metrics initialization.

pub mod config;
pub mod service;
pub mod telemetry;
