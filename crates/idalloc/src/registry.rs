use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    allocator::{BlockAllocator, HiLoAllocator, IdAllocator},
    config::{RegistryConfig, SchemeConfig},
    error::{Error, Result, Scheme},
    store::Backend,
};

/// The single entry point for allocating ids by identifier.
///
/// Owns at most one allocator per configured identifier, built lazily on
/// first use and kept for the registry's lifetime. Construct one per process
/// (or per test) and share it; independent registries over the same backend
/// behave like independent processes.
///
/// ## Example
/// ```
/// use std::sync::Arc;
/// use idalloc::{BlockConfig, IdRegistry, MemoryBackend, RegistryConfig};
///
/// let backend = MemoryBackend::new();
/// backend.seed_sequence("resource_id_seq", 1, 100);
///
/// let config = RegistryConfig::new().with_block("resource_id_seq", BlockConfig::default());
/// let registry = IdRegistry::new(Arc::new(backend), config).unwrap();
///
/// assert_eq!(registry.try_next_id("resource_id_seq").unwrap(), 1);
/// assert_eq!(registry.try_next_ids("resource_id_seq", 3).unwrap(), vec![2, 3, 4]);
/// assert!(registry.try_next_id("unknown").is_err());
/// ```
pub struct IdRegistry {
    backend: Arc<dyn Backend>,
    config: RegistryConfig,
    allocators: RwLock<HashMap<String, Arc<dyn IdAllocator>>>,
}

impl IdRegistry {
    /// Creates a registry. No allocator is built and no I/O happens until an
    /// identifier is first requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(backend: Arc<dyn Backend>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        #[cfg(feature = "tracing")]
        tracing::info!(
            identifiers = config.sequences.len(),
            lock_timeout = ?config.lock_timeout(),
            "id registry configured"
        );
        Ok(Self {
            backend,
            config,
            allocators: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the allocator for `identifier`, building it on first use.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownIdentifier`] if no scheme is configured for it.
    /// - [`Error::InvalidConfig`] if its store cannot be built.
    pub fn allocator(&self, identifier: &str) -> Result<Arc<dyn IdAllocator>> {
        if let Some(allocator) = self.allocators.read().get(identifier) {
            return Ok(Arc::clone(allocator));
        }

        let mut allocators = self.allocators.write();
        // Another caller may have built it between the two locks.
        if let Some(allocator) = allocators.get(identifier) {
            return Ok(Arc::clone(allocator));
        }
        let allocator = self.build(identifier)?;
        allocators.insert(identifier.to_owned(), Arc::clone(&allocator));
        Ok(allocator)
    }

    /// Returns the next id for `identifier`.
    ///
    /// # Errors
    ///
    /// Any error of [`IdRegistry::allocator`] or of the allocator itself.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn try_next_id(&self, identifier: &str) -> Result<i64> {
        self.allocator(identifier)?.try_next_id()
    }

    /// Returns `count` ids for `identifier` in issue order.
    ///
    /// # Errors
    ///
    /// Any error of [`IdRegistry::allocator`] or of the allocator itself.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn try_next_ids(&self, identifier: &str, count: usize) -> Result<Vec<i64>> {
        self.allocator(identifier)?.try_next_ids(count)
    }

    /// The scheme `identifier` is bound to, if configured.
    pub fn scheme_of(&self, identifier: &str) -> Option<Scheme> {
        self.config.sequences.get(identifier).map(SchemeConfig::scheme)
    }

    /// Every configured identifier, in sorted order.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.config.sequences.keys().map(String::as_str)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn build(&self, identifier: &str) -> Result<Arc<dyn IdAllocator>> {
        let lock_timeout = self.config.lock_timeout();
        let allocator: Arc<dyn IdAllocator> = match self.config.sequences.get(identifier) {
            None => {
                return Err(Error::UnknownIdentifier {
                    identifier: identifier.to_owned(),
                });
            }
            Some(SchemeConfig::Block(config)) => Arc::new(
                BlockAllocator::new(identifier, self.backend.sequence_store(), config.clone())
                    .with_lock_timeout(lock_timeout),
            ),
            Some(SchemeConfig::HiLo(config)) => {
                let store = self.backend.hilo_store(&config.hilo_table())?;
                Arc::new(
                    HiLoAllocator::new(identifier, store, config)?.with_lock_timeout(lock_timeout),
                )
            }
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(identifier, scheme = %allocator.scheme(), "built allocator");
        Ok(allocator)
    }
}
