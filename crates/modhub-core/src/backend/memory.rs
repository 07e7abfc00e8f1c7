//! Process-local backend implementing both store capabilities.
//!
//! Mirrors the observable behaviour of a Consul agent closely enough for the
//! registry: monotonic modification indexes, blocking prefix queries, tag
//! listings and per-instance check statuses. Failure switches let callers
//! exercise the recovery paths.

use crate::catalog::{
    CatalogService, CatalogServiceSummary, CheckStatus, ServiceCatalog, ServiceHealthEntry,
    ServiceRegistration,
};
use crate::error::{RegistryError, Result};
use crate::kv::{KvEntry, KvListing, KvStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct KvState {
    index: u64,
    /// key -> (value, modify index)
    entries: BTreeMap<String, (String, u64)>,
    /// key -> index of the delete
    tombstones: BTreeMap<String, u64>,
}

impl KvState {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn listing(&self, prefix: &str) -> KvListing {
        let mut index = 0;
        let mut entries = Vec::new();
        for (key, (value, modified)) in self.entries.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            index = index.max(*modified);
            entries.push(KvEntry {
                key: key.clone(),
                value: value.clone(),
            });
        }
        for (key, deleted) in self.tombstones.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            index = index.max(*deleted);
        }
        // Blocking queries never report index 0
        KvListing {
            index: index.max(1),
            entries,
        }
    }
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    registration: ServiceRegistration,
    checks: Vec<CheckStatus>,
}

/// In-memory KV store and service catalog.
pub struct InMemoryBackend {
    kv: Mutex<KvState>,
    catalog: Mutex<BTreeMap<String, CatalogEntry>>,
    changes: watch::Sender<u64>,
    default_check_status: Mutex<CheckStatus>,
    failing_deregistrations: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    kv_failing: AtomicBool,
    kv_writes_failing: AtomicBool,
    catalog_failing: AtomicBool,
    health_failing: AtomicBool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            kv: Mutex::new(KvState::default()),
            catalog: Mutex::new(BTreeMap::new()),
            changes,
            default_check_status: Mutex::new(CheckStatus::Passing),
            failing_deregistrations: Mutex::new(HashSet::new()),
            failing_reads: Mutex::new(HashSet::new()),
            kv_failing: AtomicBool::new(false),
            kv_writes_failing: AtomicBool::new(false),
            catalog_failing: AtomicBool::new(false),
            health_failing: AtomicBool::new(false),
        }
    }

    /// Make every KV call fail with a store error.
    pub fn set_kv_failing(&self, failing: bool) {
        self.kv_failing.store(failing, Ordering::SeqCst);
    }

    /// Make only KV puts and deletes fail. Reads and listings still work.
    pub fn set_kv_writes_failing(&self, failing: bool) {
        self.kv_writes_failing.store(failing, Ordering::SeqCst);
    }

    /// Make `get` of one specific key fail.
    pub fn fail_reads_of(&self, key: impl Into<String>) {
        lock(&self.failing_reads).insert(key.into());
    }

    /// Make register, deregister and listing calls on the catalog fail.
    pub fn set_catalog_failing(&self, failing: bool) {
        self.catalog_failing.store(failing, Ordering::SeqCst);
    }

    /// Make only health queries fail.
    pub fn set_health_failing(&self, failing: bool) {
        self.health_failing.store(failing, Ordering::SeqCst);
    }

    /// Make deregistration of one specific instance fail.
    pub fn fail_deregistration_of(&self, service_id: impl Into<String>) {
        lock(&self.failing_deregistrations).insert(service_id.into());
    }

    /// Status given to the health check of instances registered from now on.
    pub fn set_default_check_status(&self, status: CheckStatus) {
        *lock(&self.default_check_status) = status;
    }

    /// Replace the check statuses of an instance. Returns `false` if unknown.
    pub fn set_checks(&self, service_id: &str, checks: Vec<CheckStatus>) -> bool {
        match lock(&self.catalog).get_mut(service_id) {
            Some(entry) => {
                entry.checks = checks;
                true
            }
            None => false,
        }
    }

    pub fn set_check_status(&self, service_id: &str, status: CheckStatus) -> bool {
        self.set_checks(service_id, vec![status])
    }

    pub fn has_service(&self, service_id: &str) -> bool {
        lock(&self.catalog).contains_key(service_id)
    }

    pub fn service_ids(&self) -> Vec<String> {
        lock(&self.catalog).keys().cloned().collect()
    }

    pub fn kv_keys(&self) -> Vec<String> {
        lock(&self.kv).entries.keys().cloned().collect()
    }

    fn check_kv(&self) -> Result<()> {
        if self.kv_failing.load(Ordering::SeqCst) {
            return Err(RegistryError::store("KV store unavailable"));
        }
        Ok(())
    }

    fn check_kv_write(&self) -> Result<()> {
        self.check_kv()?;
        if self.kv_writes_failing.load(Ordering::SeqCst) {
            return Err(RegistryError::store("KV store rejected the write"));
        }
        Ok(())
    }

    fn check_catalog(&self) -> Result<()> {
        if self.catalog_failing.load(Ordering::SeqCst) {
            return Err(RegistryError::store("Service catalog unavailable"));
        }
        Ok(())
    }

    fn notify(&self, index: u64) {
        self.changes.send_replace(index);
    }

    fn to_catalog_service(registration: &ServiceRegistration) -> CatalogService {
        CatalogService {
            id: registration.id.clone(),
            name: registration.name.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tags: registration.tags.clone(),
            meta: registration.meta.clone(),
        }
    }
}

#[async_trait]
impl KvStore for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_kv()?;
        if lock(&self.failing_reads).contains(key) {
            return Err(RegistryError::store(format!("Failed to read {}", key)));
        }
        Ok(lock(&self.kv).entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_kv_write()?;
        let index = {
            let mut state = lock(&self.kv);
            let index = state.bump();
            state.tombstones.remove(key);
            state
                .entries
                .insert(key.to_string(), (value.to_string(), index));
            index
        };
        self.notify(index);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_kv_write()?;
        let index = {
            let mut state = lock(&self.kv);
            if state.entries.remove(key).is_none() {
                return Ok(());
            }
            let index = state.bump();
            state.tombstones.insert(key.to_string(), index);
            index
        };
        self.notify(index);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_kv()?;
        Ok(lock(&self.kv)
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_prefix_blocking(
        &self,
        prefix: &str,
        after_index: u64,
        wait: Duration,
    ) -> Result<KvListing> {
        let deadline = tokio::time::Instant::now() + wait;
        // Subscribe before the first snapshot so no change slips between them
        let mut changes = self.changes.subscribe();

        loop {
            self.check_kv()?;
            let listing = lock(&self.kv).listing(prefix);
            if after_index == 0 || listing.index != after_index {
                return Ok(listing);
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(listing),
            }
        }
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryBackend {
    async fn register(&self, registration: ServiceRegistration) -> Result<()> {
        self.check_catalog()?;
        let checks = if registration.check.is_some() {
            vec![*lock(&self.default_check_status)]
        } else {
            Vec::new()
        };
        lock(&self.catalog).insert(
            registration.id.clone(),
            CatalogEntry {
                registration,
                checks,
            },
        );
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        self.check_catalog()?;
        if lock(&self.failing_deregistrations).contains(service_id) {
            return Err(RegistryError::store(format!(
                "Agent refused to deregister {}",
                service_id
            )));
        }
        lock(&self.catalog).remove(service_id);
        Ok(())
    }

    async fn list_services(&self, tag: Option<&str>) -> Result<Vec<CatalogServiceSummary>> {
        self.check_catalog()?;
        let mut by_name: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for entry in lock(&self.catalog).values() {
            by_name
                .entry(entry.registration.name.clone())
                .or_default()
                .extend(entry.registration.tags.iter().cloned());
        }
        Ok(by_name
            .into_iter()
            .filter(|(_, tags)| tag.map_or(true, |t| tags.contains(t)))
            .map(|(name, tags)| CatalogServiceSummary {
                name,
                tags: tags.into_iter().collect(),
            })
            .collect())
    }

    async fn health_for_service(&self, service_name: &str) -> Result<Vec<ServiceHealthEntry>> {
        self.check_catalog()?;
        if self.health_failing.load(Ordering::SeqCst) {
            return Err(RegistryError::store("Health endpoint unavailable"));
        }
        Ok(lock(&self.catalog)
            .values()
            .filter(|entry| entry.registration.name == service_name)
            .map(|entry| ServiceHealthEntry {
                service: Self::to_catalog_service(&entry.registration),
                checks: entry.checks.clone(),
            })
            .collect())
    }

    async fn service_instances(&self, service_name: &str) -> Result<Vec<CatalogService>> {
        self.check_catalog()?;
        Ok(lock(&self.catalog)
            .values()
            .filter(|entry| entry.registration.name == service_name)
            .map(|entry| Self::to_catalog_service(&entry.registration))
            .collect())
    }

    async fn local_service_ids(&self) -> Result<Vec<String>> {
        self.check_catalog()?;
        Ok(self.service_ids())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn service(id: &str, name: &str, tags: &[&str]) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port: 50051,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            meta: HashMap::new(),
            check: None,
        }
    }

    #[tokio::test]
    async fn test_kv_put_get_delete() {
        let backend = InMemoryBackend::new();
        backend.put("a/b", "1").await.unwrap();
        assert_eq!(backend.get("a/b").await.unwrap().as_deref(), Some("1"));

        backend.delete("a/b").await.unwrap();
        assert_eq!(backend.get("a/b").await.unwrap(), None);

        // Deleting twice is fine
        backend.delete("a/b").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let backend = InMemoryBackend::new();
        backend.put("p/modules/global/b", "2").await.unwrap();
        backend.put("p/modules/global/a", "1").await.unwrap();
        backend.put("p/other", "x").await.unwrap();

        let keys = backend.list_keys("p/modules/global/").await.unwrap();
        assert_eq!(keys, vec!["p/modules/global/a", "p/modules/global/b"]);
    }

    #[tokio::test]
    async fn test_prefix_index_moves_on_delete() {
        let backend = InMemoryBackend::new();
        backend.put("p/a", "1").await.unwrap();
        let before = backend
            .list_prefix_blocking("p/", 0, Duration::ZERO)
            .await
            .unwrap();

        backend.delete("p/a").await.unwrap();
        let after = backend
            .list_prefix_blocking("p/", 0, Duration::ZERO)
            .await
            .unwrap();

        assert!(after.index > before.index);
        assert!(after.entries.is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_write_does_not_move_prefix_index() {
        let backend = InMemoryBackend::new();
        backend.put("p/a", "1").await.unwrap();
        let first = backend
            .list_prefix_blocking("p/", 0, Duration::ZERO)
            .await
            .unwrap();

        backend.put("q/a", "1").await.unwrap();
        let second = backend
            .list_prefix_blocking("p/", first.index, Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(first.index, second.index);
    }

    #[tokio::test]
    async fn test_blocking_query_wakes_on_change() {
        let backend = Arc::new(InMemoryBackend::new());
        let first = backend
            .list_prefix_blocking("p/", 0, Duration::ZERO)
            .await
            .unwrap();

        let writer = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.put("p/new", "v").await.unwrap();
        });

        let next = backend
            .list_prefix_blocking("p/", first.index, Duration::from_secs(10))
            .await
            .unwrap();
        assert_ne!(next.index, first.index);
        assert_eq!(next.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_list_services_by_tag() {
        let backend = InMemoryBackend::new();
        backend
            .register(service("echo-1", "echo", &["module", "global"]))
            .await
            .unwrap();
        backend
            .register(service("web-1", "web", &["http"]))
            .await
            .unwrap();

        let modules = backend.list_services(Some("module")).await.unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "echo");
        assert_eq!(backend.list_services(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_reports_check_statuses() {
        let backend = InMemoryBackend::new();
        backend
            .register(service("echo-1", "echo", &["module"]))
            .await
            .unwrap();
        backend.set_checks("echo-1", vec![CheckStatus::Passing, CheckStatus::Warning]);

        let health = backend.health_for_service("echo").await.unwrap();
        assert_eq!(health.len(), 1);
        assert_eq!(
            health[0].checks,
            vec![CheckStatus::Passing, CheckStatus::Warning]
        );
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let backend = InMemoryBackend::new();
        backend.set_kv_failing(true);
        assert!(backend.get("k").await.is_err());
        backend.set_kv_failing(false);
        assert!(backend.get("k").await.is_ok());

        backend.set_health_failing(true);
        assert!(backend.health_for_service("echo").await.is_err());
        assert!(backend.service_instances("echo").await.is_ok());

        backend
            .register(service("echo-1", "echo", &["module"]))
            .await
            .unwrap();
        backend.fail_deregistration_of("echo-1");
        assert!(backend.deregister("echo-1").await.is_err());
        assert!(backend.deregister("unknown").await.is_ok());
    }

    #[tokio::test]
    async fn test_narrow_kv_failure_switches() {
        let backend = InMemoryBackend::new();
        backend.put("a", "1").await.unwrap();
        backend.put("b", "2").await.unwrap();

        backend.set_kv_writes_failing(true);
        assert!(backend.put("c", "3").await.is_err());
        assert!(backend.delete("a").await.is_err());
        assert_eq!(backend.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(backend.list_keys("").await.unwrap().len(), 2);
        backend.set_kv_writes_failing(false);

        backend.fail_reads_of("b");
        assert!(backend.get("b").await.is_err());
        assert!(backend.get("a").await.is_ok());
    }
}
