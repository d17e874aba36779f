//! gRPC service implementation for id allocation.
//!
//! This module defines [`IdService`], the concrete implementation of the
//! [`IdAllocation`] gRPC service defined in the protobuf specification. It
//! owns the process-wide [`IdRegistry`] and serves `NextId` / `NextIds` from
//! it.
//!
//! ## Responsibilities
//!
//! - Validate incoming requests and enforce limits.
//! - Run the synchronous allocator on the blocking pool, bounded by the
//!   request timeout.
//! - Reject new requests once shutdown has begun.

use crate::server::{
    config::ServerConfig,
    telemetry::{
        increment_allocation_errors, increment_ids_issued, increment_requests,
        record_allocation_duration,
    },
};
use idalloc::IdRegistry;
use idalloc_tonic_core::{
    Error, Result,
    proto::{
        NextIdRequest, NextIdResponse, NextIdsRequest, NextIdsResponse,
        id_allocation_server::IdAllocation,
    },
};
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

/// gRPC front end over one [`IdRegistry`].
///
/// Clones share the registry and the shutdown token, so every connection
/// draws from the same allocators.
#[derive(Clone)]
pub struct IdService {
    config: Arc<ServerConfig>,
    registry: Arc<IdRegistry>,
    shutdown_token: CancellationToken,
}

impl IdService {
    pub fn new(config: ServerConfig, registry: IdRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Stops accepting requests. Requests already running complete normally.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();
        #[cfg(feature = "tracing")]
        tracing::info!("id service stopped accepting requests");
        Ok(())
    }

    fn validate(&self, identifier: &str, count: usize) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        if identifier.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "Identifier must not be empty".to_string(),
            });
        }
        if count == 0 {
            return Err(Error::InvalidRequest {
                reason: "Count must be greater than 0".to_string(),
            });
        }
        if count > self.config.max_ids_per_request {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "Count {} exceeds maximum allowed ({})",
                    count, self.config.max_ids_per_request
                ),
            });
        }
        Ok(())
    }

    /// Runs `allocate` on the blocking pool.
    ///
    /// A timed-out allocation keeps running in the background; any ids it
    /// draws are discarded and never reissued.
    async fn run_blocking<T, F>(&self, identifier: String, allocate: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&IdRegistry, &str) -> idalloc::Result<T> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let task = tokio::task::spawn_blocking(move || allocate(&registry, &identifier));

        match tokio::time::timeout(self.config.request_timeout, task).await {
            Ok(Ok(result)) => result.map_err(Error::from),
            Ok(Err(join_err)) => Err(Error::TaskFailed {
                context: join_err.to_string(),
            }),
            Err(_) => Err(Error::Timeout(self.config.request_timeout)),
        }
    }

    async fn serve<T, F>(
        &self,
        method: &'static str,
        identifier: String,
        count: usize,
        allocate: F,
    ) -> core::result::Result<T, Status>
    where
        T: Send + 'static,
        F: FnOnce(&IdRegistry, &str) -> idalloc::Result<T> + Send + 'static,
    {
        let start = Instant::now();
        increment_requests(method);

        let result = match self.validate(&identifier, count) {
            Ok(()) => self.run_blocking(identifier, allocate).await,
            Err(e) => Err(e),
        };
        record_allocation_duration(start.elapsed().as_secs_f64() * 1_000.0);

        result.map_err(|e| {
            #[cfg(feature = "tracing")]
            tracing::warn!("Error: {}", e);
            let status = Status::from(e);
            increment_allocation_errors(status.code());
            status
        })
    }
}

#[tonic::async_trait]
impl IdAllocation for IdService {
    /// Returns the next id for the requested identifier.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(skip_all, fields(identifier = %req.get_ref().identifier))
    )]
    async fn next_id(
        &self,
        req: Request<NextIdRequest>,
    ) -> core::result::Result<Response<NextIdResponse>, Status> {
        let NextIdRequest { identifier } = req.into_inner();
        let id = self
            .serve("next_id", identifier, 1, |registry, identifier| {
                registry.try_next_id(identifier)
            })
            .await?;

        increment_ids_issued(1);
        Ok(Response::new(NextIdResponse { id }))
    }

    /// Returns `count` ids for the requested identifier, in issue order.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            skip_all,
            fields(identifier = %req.get_ref().identifier, count = req.get_ref().count)
        )
    )]
    async fn next_ids(
        &self,
        req: Request<NextIdsRequest>,
    ) -> core::result::Result<Response<NextIdsResponse>, Status> {
        let NextIdsRequest { identifier, count } = req.into_inner();
        let count = count as usize;
        let ids = self
            .serve("next_ids", identifier, count, move |registry, identifier| {
                registry.try_next_ids(identifier, count)
            })
            .await?;

        increment_ids_issued(ids.len() as u64);
        Ok(Response::new(NextIdsResponse { ids }))
    }
}
