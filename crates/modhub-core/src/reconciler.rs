//! Drift repair between the KV registry and the service catalog.
//!
//! A zombie is a module that is inconsistent across the two stores:
//!
//! - registered and failing its health checks in the catalog,
//! - registered but absent from the catalog,
//! - present in the catalog under the `module` tag but not registered.
//!
//! Every zombie is removed through the engine's deregistration path.

use crate::catalog::{CatalogService, ServiceCatalog, ServiceHealthEntry};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::health::worst_status;
use crate::registry::{
    HealthStatus, ModuleRegistration, ModuleRegistryEngine, ZombieCleanupResult, UNKNOWN,
};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a module was classified as a zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZombieKind {
    /// Registered, and the catalog reports a critical check.
    Unhealthy,
    /// Registered, and no catalog instance carries its id.
    MissingFromCatalog,
    /// Catalog instance with no registration behind it.
    Unregistered,
}

/// A classified zombie and the record used to deregister it.
#[derive(Debug, Clone)]
pub struct Zombie {
    pub kind: ZombieKind,
    pub registration: ModuleRegistration,
}

/// Catalog view gathered for one pass.
#[derive(Debug, Default)]
struct CatalogSnapshot {
    critical: HashSet<String>,
    healthy_or_warning: HashSet<String>,
    instances: Vec<CatalogService>,
}

impl CatalogSnapshot {
    fn ids(&self) -> HashSet<&str> {
        self.instances.iter().map(|s| s.id.as_str()).collect()
    }
}

pub struct ZombieReconciler {
    engine: Arc<ModuleRegistryEngine>,
    catalog: Arc<dyn ServiceCatalog>,
    fanout_limit: usize,
}

impl ZombieReconciler {
    pub fn new(engine: Arc<ModuleRegistryEngine>, fanout_limit: usize) -> Self {
        let catalog = engine.catalog().clone();
        Self {
            engine,
            catalog,
            fanout_limit: fanout_limit.max(1),
        }
    }

    /// Detect and deregister zombies. Never fails; problems are reported in
    /// the result's `errors`.
    pub async fn cleanup_zombie_instances(&self) -> ZombieCleanupResult {
        info!("Starting zombie instance cleanup");

        let zombies = match self.detect_zombies().await {
            Ok(zombies) => zombies,
            Err(e) => {
                error!("Zombie cleanup failed: {}", e);
                return ZombieCleanupResult::failed(e);
            }
        };

        if zombies.is_empty() {
            debug!("No zombie instances found");
            return ZombieCleanupResult::default();
        }

        let detected = zombies.len();
        info!("Found {} zombie instances", detected);

        let engine = &self.engine;
        let outcomes: Vec<(String, Result<()>)> = stream::iter(zombies)
            .map(|zombie| async move {
                let id = zombie.registration.module_id;
                debug!("Removing zombie {} ({:?})", id, zombie.kind);
                let outcome = engine.deregister_module(&id).await;
                (id, outcome)
            })
            .buffer_unordered(self.fanout_limit)
            .collect()
            .await;

        let mut result = ZombieCleanupResult {
            zombies_detected: detected,
            ..ZombieCleanupResult::default()
        };
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => result.zombies_cleaned += 1,
                Err(e) => {
                    warn!("Failed to clean zombie {}: {}", id, e);
                    result
                        .errors
                        .push(format!("Failed to clean zombie {}: {}", id, e));
                }
            }
        }

        info!(
            "Zombie cleanup finished: detected {}, cleaned {}",
            result.zombies_detected, result.zombies_cleaned
        );
        result
    }

    /// Classify zombies without removing anything.
    pub async fn detect_zombies(&self) -> Result<Vec<Zombie>> {
        let registered = self.engine.try_list_registered_modules().await?;
        let snapshot = self.catalog_snapshot().await?;
        Ok(classify(&registered, &snapshot))
    }

    async fn catalog_snapshot(&self) -> Result<CatalogSnapshot> {
        let services = self
            .catalog
            .list_services(Some(RegistryConfig::MODULE_TAG))
            .await?;

        let catalog = &self.catalog;
        let health: Vec<Result<Vec<ServiceHealthEntry>>> = stream::iter(services)
            .map(|service| async move { catalog.health_for_service(&service.name).await })
            .buffered(self.fanout_limit)
            .collect()
            .await;

        let mut snapshot = CatalogSnapshot::default();
        for entries in health {
            // One failed query aborts the pass so missing instances are not misread as drift
            for entry in entries? {
                let id = entry.service.id.clone();
                if worst_status(&entry.checks) == HealthStatus::Critical {
                    snapshot.critical.insert(id);
                } else {
                    snapshot.healthy_or_warning.insert(id);
                }
                snapshot.instances.push(entry.service);
            }
        }
        debug!(
            "Catalog snapshot: {} critical, {} healthy or warning",
            snapshot.critical.len(),
            snapshot.healthy_or_warning.len()
        );
        Ok(snapshot)
    }

    /// Delete KV records whose id is unknown to the local catalog agent.
    /// Returns the number of records removed; errors yield `0`.
    pub async fn cleanup_stale_whitelisted_modules(&self) -> usize {
        match self.try_cleanup_stale().await {
            Ok(removed) => removed,
            Err(e) => {
                error!("Stale module cleanup failed: {}", e);
                0
            }
        }
    }

    async fn try_cleanup_stale(&self) -> Result<usize> {
        let registered = self.engine.try_list_registered_modules().await?;
        let live: HashSet<String> = self.catalog.local_service_ids().await?.into_iter().collect();

        let stale: Vec<String> = registered
            .into_iter()
            .map(|m| m.module_id)
            .filter(|id| !live.contains(id))
            .collect();
        if stale.is_empty() {
            debug!("No stale registrations found");
            return Ok(0);
        }

        let store = self.engine.store();
        let outcomes: Vec<std::result::Result<String, (String, RegistryError)>> =
            stream::iter(stale)
                .map(|id| async move {
                    match store.delete(&id).await {
                        Ok(()) => Ok(id),
                        Err(e) => Err((id, e)),
                    }
                })
                .buffer_unordered(self.fanout_limit)
                .collect()
                .await;
        self.engine.invalidate_caches();

        let mut removed = 0;
        for outcome in outcomes {
            match outcome {
                Ok(id) => {
                    info!("Removed stale registration {}", id);
                    self.engine.health_cache().invalidate(&id);
                    removed += 1;
                }
                Err((id, e)) => warn!("Failed to remove stale registration {}: {}", id, e),
            }
        }
        Ok(removed)
    }
}

fn classify(registered: &[ModuleRegistration], snapshot: &CatalogSnapshot) -> Vec<Zombie> {
    let catalog_ids = snapshot.ids();
    let registered_ids: HashSet<&str> = registered.iter().map(|m| m.module_id.as_str()).collect();

    let mut seen = HashSet::new();
    let mut zombies = Vec::new();

    for module in registered {
        let kind = if snapshot.critical.contains(&module.module_id) {
            Some(ZombieKind::Unhealthy)
        } else if !catalog_ids.contains(module.module_id.as_str()) {
            Some(ZombieKind::MissingFromCatalog)
        } else {
            None
        };
        if let Some(kind) = kind {
            if seen.insert(module.module_id.clone()) {
                zombies.push(Zombie {
                    kind,
                    registration: module.clone(),
                });
            }
        }
    }

    for service in &snapshot.instances {
        if registered_ids.contains(service.id.as_str()) {
            continue;
        }
        if seen.insert(service.id.clone()) {
            zombies.push(Zombie {
                kind: ZombieKind::Unregistered,
                registration: partial_registration(service),
            });
        }
    }

    zombies
}

/// Stand-in record for a catalog instance that has no KV registration.
fn partial_registration(service: &CatalogService) -> ModuleRegistration {
    ModuleRegistration {
        module_id: service.id.clone(),
        module_name: service.name.clone(),
        implementation_id: UNKNOWN.to_string(),
        host: service.address.clone(),
        port: service.port,
        service_type: UNKNOWN.to_string(),
        version: UNKNOWN.to_string(),
        metadata: service.meta.clone(),
        registered_at: 0,
        engine_host: service.address.clone(),
        engine_port: service.port,
        json_schema: None,
        enabled: false,
        container_id: None,
        container_name: None,
        hostname: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn module(id: &str) -> ModuleRegistration {
        ModuleRegistration {
            module_id: id.into(),
            module_name: "echo".into(),
            implementation_id: "echo-impl".into(),
            host: "10.0.0.1".into(),
            port: 50051,
            service_type: "PipeStepProcessor".into(),
            version: "1.0.0".into(),
            metadata: HashMap::new(),
            registered_at: 1,
            engine_host: "10.0.0.1".into(),
            engine_port: 50051,
            json_schema: None,
            enabled: true,
            container_id: None,
            container_name: None,
            hostname: None,
        }
    }

    fn instance(id: &str) -> CatalogService {
        CatalogService {
            id: id.into(),
            name: "echo".into(),
            address: "10.0.0.7".into(),
            port: 6000,
            tags: vec!["module".into()],
            meta: HashMap::new(),
        }
    }

    #[test]
    fn test_classification_sets() {
        let registered = vec![module("healthy"), module("sick"), module("missing")];
        let snapshot = CatalogSnapshot {
            critical: HashSet::from(["sick".to_string()]),
            healthy_or_warning: HashSet::from(["healthy".to_string(), "orphan".to_string()]),
            instances: vec![instance("healthy"), instance("sick"), instance("orphan")],
        };

        let zombies = classify(&registered, &snapshot);
        let kinds: Vec<(&str, ZombieKind)> = zombies
            .iter()
            .map(|z| (z.registration.module_id.as_str(), z.kind))
            .collect();

        assert_eq!(
            kinds,
            vec![
                ("sick", ZombieKind::Unhealthy),
                ("missing", ZombieKind::MissingFromCatalog),
                ("orphan", ZombieKind::Unregistered),
            ]
        );
    }

    #[test]
    fn test_partial_registration_fields() {
        let partial = partial_registration(&instance("orphan-1"));
        assert_eq!(partial.implementation_id, "unknown");
        assert_eq!(partial.service_type, "unknown");
        assert_eq!(partial.version, "unknown");
        assert_eq!(partial.registered_at, 0);
        assert_eq!(partial.engine_host, "10.0.0.7");
        assert_eq!(partial.engine_port, 6000);
        assert!(!partial.enabled);
        assert!(partial.json_schema.is_none());
    }

    #[test]
    fn test_duplicate_catalog_instances_counted_once() {
        let snapshot = CatalogSnapshot {
            critical: HashSet::new(),
            healthy_or_warning: HashSet::from(["orphan".to_string()]),
            instances: vec![instance("orphan"), instance("orphan")],
        };
        assert_eq!(classify(&[], &snapshot).len(), 1);
    }
}
