//! Module health derived from catalog health checks.

use crate::catalog::{CheckStatus, ServiceCatalog};
use crate::error::{RegistryError, Result};
use crate::registry::{HealthStatus, ModuleRegistryEngine, ServiceHealthStatus};
use mini_moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Short-lived cache of health results keyed by module id.
///
/// Clones share the same entries, so the engine can drop a module's entry on
/// deregistration while the evaluator fills it.
#[derive(Clone)]
pub struct HealthCache {
    inner: Cache<String, ServiceHealthStatus>,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(crate::config::RegistryConfig::MAX_CACHED_MODULES)
                .build(),
        }
    }

    pub fn get(&self, module_id: &str) -> Option<ServiceHealthStatus> {
        self.inner.get(&module_id.to_string())
    }

    pub fn insert(&self, module_id: &str, status: ServiceHealthStatus) {
        self.inner.insert(module_id.to_string(), status);
    }

    pub fn invalidate(&self, module_id: &str) {
        self.inner.invalidate(&module_id.to_string());
    }
}

/// Reduce check statuses to the worst one. No checks counts as passing.
pub fn worst_status(checks: &[CheckStatus]) -> HealthStatus {
    if checks.iter().any(|c| *c == CheckStatus::Critical) {
        HealthStatus::Critical
    } else if checks.iter().any(|c| *c == CheckStatus::Warning) {
        HealthStatus::Warning
    } else {
        HealthStatus::Passing
    }
}

/// Answers "is this module healthy" from the catalog.
pub struct HealthEvaluator {
    engine: Arc<ModuleRegistryEngine>,
    catalog: Arc<dyn ServiceCatalog>,
}

impl HealthEvaluator {
    pub fn new(engine: Arc<ModuleRegistryEngine>) -> Self {
        let catalog = engine.catalog().clone();
        Self { engine, catalog }
    }

    /// Health of one registered module.
    ///
    /// Unknown modules fail with [`RegistryError::NotFound`] and are never
    /// cached. A catalog query failure reports `Warning` with
    /// `exists_in_catalog = true`.
    pub async fn get_module_health_status(&self, module_id: &str) -> Result<ServiceHealthStatus> {
        let cache = self.engine.health_cache();
        if let Some(hit) = cache.get(module_id) {
            debug!("Health cache hit for {}", module_id);
            return Ok(hit);
        }

        let registration =
            self.engine
                .get_module(module_id)
                .await
                .ok_or_else(|| RegistryError::NotFound {
                    module_id: module_id.to_string(),
                })?;

        let status = match self
            .catalog
            .health_for_service(&registration.module_name)
            .await
        {
            Ok(entries) => match entries.iter().find(|e| e.service.id == module_id) {
                Some(entry) => ServiceHealthStatus {
                    status: worst_status(&entry.checks),
                    exists_in_catalog: true,
                    registration,
                },
                None => ServiceHealthStatus {
                    status: HealthStatus::Critical,
                    exists_in_catalog: false,
                    registration,
                },
            },
            Err(e) => {
                warn!("Health query for {} failed: {}", module_id, e);
                ServiceHealthStatus {
                    status: HealthStatus::Warning,
                    exists_in_catalog: true,
                    registration,
                }
            }
        };

        cache.insert(module_id, status.clone());
        Ok(status)
    }

    pub fn invalidate(&self, module_id: &str) {
        self.engine.health_cache().invalidate(module_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::registry::{
        ConnectionValidator, EngineSettings, RegisterRequest, RegistryStore,
    };
    use async_trait::async_trait;

    struct AlwaysReachable;

    #[async_trait]
    impl ConnectionValidator for AlwaysReachable {
        async fn validate_connection(&self, _host: &str, _port: u16, _name: &str) -> bool {
            true
        }
    }

    fn evaluator(backend: Arc<InMemoryBackend>, ttl: Duration) -> HealthEvaluator {
        let engine = ModuleRegistryEngine::new(
            RegistryStore::new(backend.clone(), "pipeline", 4),
            backend,
            Arc::new(AlwaysReachable),
            EngineSettings::default(),
            HealthCache::new(ttl),
        );
        HealthEvaluator::new(Arc::new(engine))
    }

    async fn register(evaluator: &HealthEvaluator) -> String {
        evaluator
            .engine
            .register_module(RegisterRequest::new("echo", "10.0.0.1", 50051))
            .await
            .unwrap()
            .module_id
    }

    #[test]
    fn test_worst_status_reduction() {
        use CheckStatus::*;
        assert_eq!(worst_status(&[Passing, Warning]), HealthStatus::Warning);
        assert_eq!(
            worst_status(&[Passing, Critical, Warning]),
            HealthStatus::Critical
        );
        assert_eq!(worst_status(&[Passing]), HealthStatus::Passing);
        assert_eq!(worst_status(&[]), HealthStatus::Passing);
    }

    #[tokio::test]
    async fn test_unknown_module_not_found() {
        let backend = Arc::new(InMemoryBackend::new());
        let evaluator = evaluator(backend, Duration::from_secs(10));
        let err = evaluator
            .get_module_health_status("ghost-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_status_from_checks() {
        let backend = Arc::new(InMemoryBackend::new());
        let evaluator = evaluator(backend.clone(), Duration::from_secs(10));
        let id = register(&evaluator).await;
        backend.set_checks(&id, vec![CheckStatus::Passing, CheckStatus::Warning]);

        let status = evaluator.get_module_health_status(&id).await.unwrap();
        assert_eq!(status.status, HealthStatus::Warning);
        assert!(status.exists_in_catalog);
    }

    #[tokio::test]
    async fn test_missing_instance_is_critical() {
        let backend = Arc::new(InMemoryBackend::new());
        let evaluator = evaluator(backend.clone(), Duration::from_secs(10));
        let id = register(&evaluator).await;
        backend.deregister(&id).await.unwrap();

        let status = evaluator.get_module_health_status(&id).await.unwrap();
        assert_eq!(status.status, HealthStatus::Critical);
        assert!(!status.exists_in_catalog);
    }

    #[tokio::test]
    async fn test_query_failure_is_warning() {
        let backend = Arc::new(InMemoryBackend::new());
        let evaluator = evaluator(backend.clone(), Duration::from_secs(10));
        let id = register(&evaluator).await;
        backend.set_health_failing(true);

        let status = evaluator.get_module_health_status(&id).await.unwrap();
        assert_eq!(status.status, HealthStatus::Warning);
        assert!(status.exists_in_catalog);
    }

    #[tokio::test]
    async fn test_result_cached_until_invalidated() {
        let backend = Arc::new(InMemoryBackend::new());
        let evaluator = evaluator(backend.clone(), Duration::from_secs(60));
        let id = register(&evaluator).await;

        let first = evaluator.get_module_health_status(&id).await.unwrap();
        assert_eq!(first.status, HealthStatus::Passing);

        backend.set_check_status(&id, CheckStatus::Critical);
        let cached = evaluator.get_module_health_status(&id).await.unwrap();
        assert_eq!(cached.status, HealthStatus::Passing);

        evaluator.invalidate(&id);
        let fresh = evaluator.get_module_health_status(&id).await.unwrap();
        assert_eq!(fresh.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_deregistration_drops_cached_health() {
        let backend = Arc::new(InMemoryBackend::new());
        let evaluator = evaluator(backend.clone(), Duration::from_secs(60));
        let id = register(&evaluator).await;

        evaluator.get_module_health_status(&id).await.unwrap();
        evaluator.engine.deregister_module(&id).await.unwrap();

        assert!(evaluator.engine.health_cache().get(&id).is_none());
        assert!(evaluator.get_module_health_status(&id).await.is_err());
    }
}
