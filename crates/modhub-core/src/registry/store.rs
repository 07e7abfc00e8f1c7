//! KV layout and persistence for module registrations.
//!
//! Records live at `{prefix}/modules/global/{moduleId}` as camelCase JSON.
//! Archived catalog services go to `{prefix}/archive/services/{name}-{ts}`.

use super::types::ModuleRegistration;
use crate::config::RegistryConfig;
use crate::error::Result;
use crate::kv::KvStore;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

pub struct RegistryStore {
    kv: Arc<dyn KvStore>,
    prefix: String,
    fanout_limit: usize,
}

impl RegistryStore {
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str, fanout_limit: usize) -> Self {
        Self {
            kv,
            prefix: prefix.trim_matches('/').to_string(),
            fanout_limit: fanout_limit.max(1),
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}/modules/global/`, with trailing slash.
    pub fn modules_prefix(&self) -> String {
        format!("{}/{}/", self.prefix, RegistryConfig::MODULES_NAMESPACE)
    }

    pub fn module_key(&self, module_id: &str) -> String {
        format!("{}{}", self.modules_prefix(), module_id)
    }

    /// Archive key with `:` and `.` in the timestamp replaced by `-`.
    pub fn archive_key(&self, service_name: &str, timestamp: &str) -> String {
        format!(
            "{}/{}/{}-{}",
            self.prefix,
            RegistryConfig::ARCHIVE_NAMESPACE,
            service_name,
            timestamp.replace([':', '.'], "-")
        )
    }

    pub async fn save(&self, registration: &ModuleRegistration) -> Result<()> {
        let body = serde_json::to_string(registration)?;
        self.kv
            .put(&self.module_key(&registration.module_id), &body)
            .await
    }

    /// Read one record. Undecodable values are logged and treated as absent.
    pub async fn load(&self, module_id: &str) -> Result<Option<ModuleRegistration>> {
        let key = self.module_key(module_id);
        Ok(self
            .kv
            .get(&key)
            .await?
            .and_then(|raw| decode(&key, &raw)))
    }

    pub async fn delete(&self, module_id: &str) -> Result<()> {
        self.kv.delete(&self.module_key(module_id)).await
    }

    pub async fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        self.kv.put(key, value).await
    }

    /// Every record under the modules namespace, deduplicated by id.
    ///
    /// Store errors propagate, including a failed fetch of a single key.
    /// Values are fetched concurrently, at most `fanout_limit` at a time.
    pub async fn list(&self) -> Result<Vec<ModuleRegistration>> {
        let mut records = Records::default();
        for (key, value) in self.fetch_all().await? {
            records.push(&key, value?);
        }
        Ok(records.into_inner())
    }

    /// Like [`Self::list`], but a key whose fetch fails is logged and left
    /// out instead of failing the whole listing. Only the key listing itself
    /// can fail.
    pub async fn list_readable(&self) -> Result<Vec<ModuleRegistration>> {
        let mut records = Records::default();
        for (key, value) in self.fetch_all().await? {
            match value {
                Ok(value) => records.push(&key, value),
                Err(e) => warn!("Skipping unreadable registration at {}: {}", key, e),
            }
        }
        Ok(records.into_inner())
    }

    async fn fetch_all(&self) -> Result<Vec<(String, Result<Option<String>>)>> {
        let prefix = self.modules_prefix();
        let keys: Vec<String> = self
            .kv
            .list_keys(&prefix)
            .await?
            .into_iter()
            .filter(|key| key.len() > prefix.len())
            .collect();

        let kv = &self.kv;
        Ok(stream::iter(keys)
            .map(|key| async move {
                let value = kv.get(&key).await;
                (key, value)
            })
            .buffered(self.fanout_limit)
            .collect()
            .await)
    }
}

#[derive(Default)]
struct Records {
    seen: HashSet<String>,
    records: Vec<ModuleRegistration>,
}

impl Records {
    fn push(&mut self, key: &str, value: Option<String>) {
        // None: deleted between listing and fetch
        let Some(raw) = value else {
            return;
        };
        if let Some(record) = decode(key, &raw) {
            if self.seen.insert(record.module_id.clone()) {
                self.records.push(record);
            }
        }
    }

    fn into_inner(self) -> Vec<ModuleRegistration> {
        self.records
    }
}

fn decode(key: &str, raw: &str) -> Option<ModuleRegistration> {
    match serde_json::from_str::<ModuleRegistration>(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Skipping undecodable registration at {}: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use std::collections::HashMap;

    fn record(id: &str) -> ModuleRegistration {
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

    #[test]
    fn test_key_layout() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = RegistryStore::new(backend, "/pipeline/", 4);
        assert_eq!(store.modules_prefix(), "pipeline/modules/global/");
        assert_eq!(store.module_key("echo-1"), "pipeline/modules/global/echo-1");
        assert_eq!(
            store.archive_key("echo", "2024-05-01T10:20:30.123Z"),
            "pipeline/archive/services/echo-2024-05-01T10-20-30-123Z"
        );
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = RegistryStore::new(backend, "pipeline", 4);

        store.save(&record("echo-1")).await.unwrap();
        assert_eq!(store.load("echo-1").await.unwrap(), Some(record("echo-1")));

        store.delete("echo-1").await.unwrap();
        assert_eq!(store.load("echo-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_skips_undecodable_and_keeps_order() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = RegistryStore::new(backend.clone(), "pipeline", 2);

        for id in ["a-1", "b-1", "c-1"] {
            store.save(&record(id)).await.unwrap();
        }
        backend
            .put("pipeline/modules/global/bad", "{garbage")
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.module_id)
            .collect();
        assert_eq!(ids, vec!["a-1", "b-1", "c-1"]);
    }

    #[tokio::test]
    async fn test_list_deduplicates_by_id() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = RegistryStore::new(backend.clone(), "pipeline", 4);

        store.save(&record("a-1")).await.unwrap();
        let copy = serde_json::to_string(&record("a-1")).unwrap();
        backend
            .put("pipeline/modules/global/a-1-copy", &copy)
            .await
            .unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_propagates_store_errors() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = RegistryStore::new(backend.clone(), "pipeline", 4);
        backend.set_kv_failing(true);
        assert!(store.list().await.is_err());
    }

    #[tokio::test]
    async fn test_unreadable_key_handling() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = RegistryStore::new(backend.clone(), "pipeline", 4);
        for id in ["a-1", "b-1", "c-1"] {
            store.save(&record(id)).await.unwrap();
        }
        backend.fail_reads_of("pipeline/modules/global/b-1");

        assert!(store.list().await.is_err());

        let ids: Vec<String> = store
            .list_readable()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.module_id)
            .collect();
        assert_eq!(ids, vec!["a-1", "c-1"]);
    }
}
