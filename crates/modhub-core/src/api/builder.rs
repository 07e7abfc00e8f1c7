//! Builder for wiring a [`ModuleHub`].

use std::sync::Arc;
use tracing::info;

use super::ModuleHub;
use crate::backend::ConsulBackend;
use crate::catalog::ServiceCatalog;
use crate::config::HubConfig;
use crate::error::Result;
use crate::health::{HealthCache, HealthEvaluator};
use crate::kv::KvStore;
use crate::reconciler::ZombieReconciler;
use crate::registry::{
    ConnectionValidator, EngineSettings, ModuleRegistryEngine, RegistryStore,
    TcpConnectionValidator,
};
use crate::scheduler::{CleanupScheduler, SchedulerSettings};
use crate::watch::{ChangeWatcher, WatchSettings};

/// Explicit constructor injection for the registry components.
///
/// Anything not supplied falls back to a default: a [`ConsulBackend`] built
/// from `config.consul` for both stores, and a [`TcpConnectionValidator`]
/// using `config.connection_timeout`.
///
/// # Example
///
/// ```rust,ignore
/// use modhub_core::{HubConfig, InMemoryBackend, ModuleHub};
/// use std::sync::Arc;
///
/// let backend = Arc::new(InMemoryBackend::new());
/// let hub = ModuleHub::builder(HubConfig::default())
///     .with_backend(backend)
///     .build()?;
/// ```
pub struct ModuleHubBuilder {
    config: HubConfig,
    kv: Option<Arc<dyn KvStore>>,
    catalog: Option<Arc<dyn ServiceCatalog>>,
    validator: Option<Arc<dyn ConnectionValidator>>,
}

impl ModuleHubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            kv: None,
            catalog: None,
            validator: None,
        }
    }

    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Use one object for both the KV store and the catalog.
    pub fn with_backend<B>(self, backend: Arc<B>) -> Self
    where
        B: KvStore + ServiceCatalog + 'static,
    {
        self.with_kv(backend.clone()).with_catalog(backend)
    }

    pub fn with_validator(mut self, validator: Arc<dyn ConnectionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Validate the configuration and assemble every component.
    ///
    /// Nothing is started; see [`ModuleHub::start`].
    pub fn build(self) -> Result<ModuleHub> {
        let config = self.config;
        config.validate()?;

        let (kv, catalog) = match (self.kv, self.catalog) {
            (Some(kv), Some(catalog)) => (kv, catalog),
            (kv, catalog) => {
                info!("Connecting to Consul at {}", config.consul.base_url());
                let consul = Arc::new(ConsulBackend::new(&config.consul)?);
                let kv = kv.unwrap_or_else(|| consul.clone() as Arc<dyn KvStore>);
                let catalog = catalog.unwrap_or_else(|| consul as Arc<dyn ServiceCatalog>);
                (kv, catalog)
            }
        };
        let validator = self.validator.unwrap_or_else(|| {
            Arc::new(TcpConnectionValidator::new(config.connection_timeout))
                as Arc<dyn ConnectionValidator>
        });

        let prefix = config.normalized_prefix().to_string();
        let engine = Arc::new(ModuleRegistryEngine::new(
            RegistryStore::new(kv.clone(), &prefix, config.fanout_limit),
            catalog,
            validator,
            EngineSettings {
                health_check_interval: config.health_check_interval,
                deregister_after: config.deregister_after,
            },
            HealthCache::new(config.health_cache_ttl),
        ));

        let health = HealthEvaluator::new(engine.clone());
        let reconciler = Arc::new(ZombieReconciler::new(engine.clone(), config.fanout_limit));
        let scheduler = CleanupScheduler::new(
            reconciler.clone(),
            SchedulerSettings {
                enabled: config.cleanup_enabled,
                interval: config.cleanup_interval,
                initial_delay: config.cleanup_initial_delay,
            },
        );
        let watcher = Arc::new(ChangeWatcher::new(
            kv,
            WatchSettings {
                kv_prefix: prefix,
                cluster_name: config.cluster_name.clone(),
                enabled: config.watch_enabled,
                startup_delay: config.watch_startup_delay,
                wait: config.watch_wait,
            },
        ));

        Ok(ModuleHub {
            config,
            engine,
            health,
            reconciler,
            scheduler,
            watcher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[tokio::test]
    async fn test_build_with_backend() {
        let backend = Arc::new(InMemoryBackend::new());
        let hub = ModuleHubBuilder::new(HubConfig::default())
            .with_backend(backend)
            .build()
            .unwrap();

        assert!(!hub.watcher().is_running());
        assert!(!hub.scheduler().is_running());
        assert_eq!(hub.config().normalized_prefix(), "pipeline");
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = HubConfig {
            kv_prefix: "/".into(),
            ..HubConfig::default()
        };
        let result = ModuleHubBuilder::new(config)
            .with_backend(Arc::new(InMemoryBackend::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_defaults_to_consul() {
        // Only constructs the HTTP client; no request is made
        assert!(ModuleHubBuilder::new(HubConfig::default()).build().is_ok());
    }
}
