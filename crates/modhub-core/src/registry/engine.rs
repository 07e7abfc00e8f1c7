//! Module registration lifecycle over the KV store and the service catalog.
//!
//! The KV record and the catalog instance are written separately with no
//! cross-store transaction. Registration writes the catalog first and the KV
//! second; a failure between the two leaves a catalog-only instance for the
//! reconciler. Duplicate checks are check-then-act: two concurrent requests
//! for the same endpoint can both pass.

use super::schema::{schemas_compatible, validate_schema};
use super::store::RegistryStore;
use super::types::{ModuleRegistration, RegisterRequest};
use super::validator::ConnectionValidator;
use crate::catalog::{HealthCheckSpec, ServiceCatalog, ServiceRegistration};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::health::HealthCache;
use chrono::{SecondsFormat, Utc};
use mini_moka::sync::Cache;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Settings the engine applies to every catalog registration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub health_check_interval: Duration,
    pub deregister_after: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            health_check_interval: RegistryConfig::HEALTH_CHECK_INTERVAL,
            deregister_after: RegistryConfig::DEREGISTER_AFTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ListView {
    All,
    Enabled,
}

/// Registry engine: admission checks, dual writes and cached reads.
pub struct ModuleRegistryEngine {
    store: RegistryStore,
    catalog: Arc<dyn ServiceCatalog>,
    validator: Arc<dyn ConnectionValidator>,
    settings: EngineSettings,
    list_cache: Cache<ListView, Arc<Vec<ModuleRegistration>>>,
    module_cache: Cache<String, ModuleRegistration>,
    /// Bumped by every invalidation; a read only stays cached if no bump
    /// happened while it was in flight.
    generation: AtomicU64,
    health_cache: HealthCache,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveRecord<'a> {
    service_name: &'a str,
    service_id: &'a str,
    address: &'a str,
    port: u16,
    archived_at: &'a str,
    reason: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReducedArchiveRecord<'a> {
    service_name: &'a str,
    archived_at: &'a str,
    reason: &'a str,
}

impl ModuleRegistryEngine {
    pub fn new(
        store: RegistryStore,
        catalog: Arc<dyn ServiceCatalog>,
        validator: Arc<dyn ConnectionValidator>,
        settings: EngineSettings,
        health_cache: HealthCache,
    ) -> Self {
        Self {
            store,
            catalog,
            validator,
            settings,
            list_cache: Cache::builder().max_capacity(2).build(),
            module_cache: Cache::builder()
                .max_capacity(RegistryConfig::MAX_CACHED_MODULES)
                .build(),
            generation: AtomicU64::new(0),
            health_cache,
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<dyn ServiceCatalog> {
        &self.catalog
    }

    pub fn health_cache(&self) -> &HealthCache {
        &self.health_cache
    }

    /// Admit a new module instance.
    ///
    /// Checks run in order and the first failure is returned: schema
    /// validity, container uniqueness, endpoint uniqueness, schema
    /// consistency within the module name, reachability.
    pub async fn register_module(&self, request: RegisterRequest) -> Result<ModuleRegistration> {
        let module_name = request.module_name.trim().to_string();
        if module_name.is_empty() {
            return Err(RegistryError::Validation {
                field: "moduleName".into(),
                message: "must not be blank".into(),
            });
        }
        if request.host.trim().is_empty() {
            return Err(RegistryError::Validation {
                field: "host".into(),
                message: "must not be blank".into(),
            });
        }

        info!(
            "Registering module {} at {}:{}",
            module_name, request.host, request.port
        );

        if let Some(schema) = request.schema() {
            validate_schema(&module_name, schema).inspect_err(|e| {
                warn!("Rejected registration of {}: {}", module_name, e);
            })?;
        }

        let existing = self.try_list_registered_modules().await?;
        self.check_duplicates(&module_name, &request, &existing)
            .inspect_err(|e| warn!("Rejected registration of {}: {}", module_name, e))?;

        if !self
            .validator
            .validate_connection(&request.host, request.port, &module_name)
            .await
        {
            let err = RegistryError::Unreachable {
                module_name: module_name.clone(),
                host: request.host.clone(),
                port: request.port,
            };
            warn!("Rejected registration of {}: {}", module_name, err);
            return Err(err);
        }

        let registration = build_registration(&module_name, request);
        let service = self.service_registration(&registration);

        if let Err(e) = self.catalog.register(service).await {
            error!(
                "Failed to register {} in the service catalog: {}",
                registration.module_id, e
            );
            return Err(e);
        }

        let saved = self.store.save(&registration).await;
        self.invalidate_caches();
        if let Err(e) = saved {
            // Catalog entry stays behind; the reconciler removes it as catalog-only drift
            error!(
                "Registered {} in the catalog but failed to persist it: {}",
                registration.module_id, e
            );
            return Err(e);
        }

        info!(
            "Registered module {} ({}) at {}:{}",
            registration.module_id, module_name, registration.host, registration.port
        );
        Ok(registration)
    }

    fn check_duplicates(
        &self,
        module_name: &str,
        request: &RegisterRequest,
        existing: &[ModuleRegistration],
    ) -> Result<()> {
        if let Some(container_id) = request.container_id() {
            if let Some(found) = existing
                .iter()
                .find(|m| m.container_id() == Some(container_id))
            {
                return Err(RegistryError::DuplicateContainer {
                    container_id: container_id.to_string(),
                    existing_module: found.module_name.clone(),
                });
            }
        }

        if existing
            .iter()
            .any(|m| m.host == request.host && m.port == request.port)
        {
            return Err(RegistryError::EndpointConflict {
                host: request.host.clone(),
                port: request.port,
            });
        }

        let incompatible = existing
            .iter()
            .filter(|m| m.module_name == module_name)
            .any(|m| !schemas_compatible(m.schema(), request.schema()));
        if incompatible {
            return Err(RegistryError::SchemaMismatch {
                module_name: module_name.to_string(),
            });
        }

        Ok(())
    }

    fn service_registration(&self, registration: &ModuleRegistration) -> ServiceRegistration {
        let mut meta = HashMap::new();
        meta.insert("moduleName".to_string(), registration.module_name.clone());
        meta.insert(
            "implementationId".to_string(),
            registration.implementation_id.clone(),
        );
        meta.insert("serviceType".to_string(), registration.service_type.clone());
        meta.insert(
            "service-type".to_string(),
            RegistryConfig::SERVICE_TYPE_META.to_string(),
        );
        meta.insert("version".to_string(), registration.version.clone());
        meta.insert(
            "registeredAt".to_string(),
            registration.registered_at.to_string(),
        );
        if let Some(id) = registration.container_id() {
            meta.insert("containerId".to_string(), id.to_string());
        }
        if let Some(name) = registration.container_name() {
            meta.insert("containerName".to_string(), name.to_string());
        }
        if let Some(hostname) = registration.hostname() {
            meta.insert("hostname".to_string(), hostname.to_string());
        }
        if let Some(schema) = registration.schema() {
            meta.insert("jsonSchema".to_string(), schema.to_string());
        }
        if registration.engine_host != registration.host
            || registration.engine_port != registration.port
        {
            meta.insert("engineHost".to_string(), registration.engine_host.clone());
            meta.insert(
                "enginePort".to_string(),
                registration.engine_port.to_string(),
            );
        }

        let mut tags = vec![
            RegistryConfig::MODULE_TAG.to_string(),
            RegistryConfig::GLOBAL_TAG.to_string(),
        ];
        if !registration.service_type.is_empty() {
            tags.push(registration.service_type.clone());
        }
        tags.push(format!("version:{}", registration.version));

        ServiceRegistration {
            id: registration.module_id.clone(),
            name: registration.module_name.clone(),
            address: registration.host.clone(),
            port: registration.port,
            tags,
            meta,
            check: Some(HealthCheckSpec {
                name: RegistryConfig::HEALTH_CHECK_NAME.to_string(),
                grpc: format!("{}:{}", registration.host, registration.port),
                grpc_use_tls: false,
                interval: self.settings.health_check_interval,
                deregister_critical_after: self.settings.deregister_after,
            }),
        }
    }

    /// All registrations. Store failures are logged and yield an empty list;
    /// a single unreadable record is skipped.
    pub async fn list_registered_modules(&self) -> Vec<ModuleRegistration> {
        self.cached_list(ListView::All).await
    }

    /// Registrations with `enabled == true`.
    pub async fn list_enabled_modules(&self) -> Vec<ModuleRegistration> {
        self.cached_list(ListView::Enabled).await
    }

    async fn cached_list(&self, view: ListView) -> Vec<ModuleRegistration> {
        if let Some(hit) = self.list_cache.get(&view) {
            return hit.as_ref().clone();
        }

        let generation = self.generation.load(Ordering::SeqCst);
        match self.store.list_readable().await {
            Ok(all) => {
                let records = match view {
                    ListView::All => all,
                    ListView::Enabled => all.into_iter().filter(|m| m.enabled).collect(),
                };
                self.list_cache.insert(view, Arc::new(records.clone()));
                if self.generation.load(Ordering::SeqCst) != generation {
                    // Read raced a mutation; the result may predate it
                    self.list_cache.invalidate(&view);
                }
                records
            }
            Err(e) => {
                warn!("Failed to list registered modules: {}", e);
                Vec::new()
            }
        }
    }

    /// Uncached listing that propagates store errors.
    pub async fn try_list_registered_modules(&self) -> Result<Vec<ModuleRegistration>> {
        self.store.list().await
    }

    /// Direct lookup. Store failures are logged and yield `None`.
    pub async fn get_module(&self, module_id: &str) -> Option<ModuleRegistration> {
        if let Some(hit) = self.module_cache.get(&module_id.to_string()) {
            return Some(hit);
        }
        let generation = self.generation.load(Ordering::SeqCst);
        match self.store.load(module_id).await {
            Ok(Some(record)) => {
                let key = module_id.to_string();
                self.module_cache.insert(key.clone(), record.clone());
                if self.generation.load(Ordering::SeqCst) != generation {
                    self.module_cache.invalidate(&key);
                }
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read module {}: {}", module_id, e);
                None
            }
        }
    }

    pub async fn enable_module(&self, module_id: &str) -> bool {
        self.set_enabled(module_id, true).await
    }

    pub async fn disable_module(&self, module_id: &str) -> bool {
        self.set_enabled(module_id, false).await
    }

    // Read-modify-write without compare-and-set: the last writer wins.
    async fn set_enabled(&self, module_id: &str, enabled: bool) -> bool {
        let action = if enabled { "enable" } else { "disable" };
        let current = match self.store.load(module_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Module {} not found, cannot {}", module_id, action);
                return false;
            }
            Err(e) => {
                warn!("Failed to read module {} to {}: {}", module_id, action, e);
                return false;
            }
        };

        let updated = current.with_enabled(enabled);
        let result = self.store.save(&updated).await;
        self.invalidate_caches();
        match result {
            Ok(()) => {
                info!("Module {} {}d", module_id, action);
                true
            }
            Err(e) => {
                warn!("Failed to {} module {}: {}", action, module_id, e);
                false
            }
        }
    }

    /// Remove a module from the catalog and then from the KV store.
    ///
    /// Unknown ids succeed.
    pub async fn deregister_module(&self, module_id: &str) -> Result<()> {
        let result = self.remove_everywhere(module_id).await;
        self.invalidate_caches();
        self.health_cache.invalidate(module_id);
        match &result {
            Ok(()) => info!("Deregistered module {}", module_id),
            Err(e) => warn!("Failed to deregister module {}: {}", module_id, e),
        }
        result
    }

    async fn remove_everywhere(&self, module_id: &str) -> Result<()> {
        self.catalog.deregister(module_id).await?;
        self.store.delete(module_id).await
    }

    /// Record a catalog service under the archive namespace, then remove its
    /// first instance from the catalog. Returns `false` if the service is
    /// unknown or any step fails.
    pub async fn archive_service(&self, service_name: &str, reason: &str) -> bool {
        let result = self.try_archive_service(service_name, reason).await;
        self.invalidate_caches();
        match result {
            Ok(archived) => archived,
            Err(e) => {
                error!("Failed to archive service {}: {}", service_name, e);
                false
            }
        }
    }

    async fn try_archive_service(&self, service_name: &str, reason: &str) -> Result<bool> {
        let instances = self.catalog.service_instances(service_name).await?;
        let Some(instance) = instances.into_iter().next() else {
            warn!("Service {} not found in the catalog", service_name);
            return Ok(false);
        };

        let archived_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let name = if instance.name.is_empty() {
            service_name
        } else {
            instance.name.as_str()
        };
        let body = match serde_json::to_string(&ArchiveRecord {
            service_name: name,
            service_id: &instance.id,
            address: &instance.address,
            port: instance.port,
            archived_at: &archived_at,
            reason,
        }) {
            Ok(body) => body,
            Err(e) => {
                warn!("Falling back to reduced archive record for {}: {}", service_name, e);
                serde_json::to_string(&ReducedArchiveRecord {
                    service_name,
                    archived_at: &archived_at,
                    reason,
                })?
            }
        };

        let key = self.store.archive_key(service_name, &archived_at);
        self.store.put_raw(&key, &body).await?;

        let service_id = if instance.id.is_empty() {
            service_name
        } else {
            instance.id.as_str()
        };
        self.catalog.deregister(service_id).await?;
        self.health_cache.invalidate(service_id);

        info!("Archived and deregistered service {} ({})", service_name, key);
        Ok(true)
    }

    /// Drop every cached list and lookup.
    pub fn invalidate_caches(&self) {
        debug!("Invalidating registry caches");
        // Bump before clearing so a read inserting concurrently either sees
        // the new generation or is cleared below
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.list_cache.invalidate_all();
        self.module_cache.invalidate_all();
    }
}

fn build_registration(module_name: &str, request: RegisterRequest) -> ModuleRegistration {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(RegistryConfig::MODULE_ID_SUFFIX_LEN)
        .collect();
    let module_id = format!("{}-{}", module_name, suffix);

    let engine_host = if request.engine_host.trim().is_empty() {
        request.host.clone()
    } else {
        request.engine_host.clone()
    };
    let engine_port = if request.engine_port == 0 {
        request.port
    } else {
        request.engine_port
    };
    let json_schema = request.schema().map(str::to_string);
    let container_id = request.container_id().map(str::to_string);
    let container_name = request
        .metadata
        .get(super::types::CONTAINER_NAME_KEY)
        .cloned();
    let hostname = request.metadata.get(super::types::HOSTNAME_KEY).cloned();

    ModuleRegistration {
        module_id,
        module_name: module_name.to_string(),
        implementation_id: request.implementation_id,
        host: request.host,
        port: request.port,
        service_type: request.service_type,
        version: request.version,
        metadata: request.metadata,
        registered_at: Utc::now().timestamp_millis(),
        engine_host,
        engine_port,
        json_schema,
        enabled: true,
        container_id,
        container_name,
        hostname,
    }
}
