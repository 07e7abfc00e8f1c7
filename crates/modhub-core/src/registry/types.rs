//! Registry data model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata keys that carry container identity.
pub const CONTAINER_ID_KEY: &str = "containerId";
pub const CONTAINER_NAME_KEY: &str = "containerName";
pub const HOSTNAME_KEY: &str = "hostname";

/// Placeholder for fields unknown when a record is rebuilt from the catalog.
pub const UNKNOWN: &str = "unknown";

/// A registered module instance, as persisted in the KV store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRegistration {
    pub module_id: String,
    pub module_name: String,
    pub implementation_id: String,
    pub host: String,
    pub port: u16,
    pub service_type: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub registered_at: i64,
    pub engine_host: String,
    pub engine_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ModuleRegistration {
    /// Container id from the dedicated field or, failing that, the metadata map.
    pub fn container_id(&self) -> Option<&str> {
        self.container_id
            .as_deref()
            .or_else(|| self.metadata.get(CONTAINER_ID_KEY).map(String::as_str))
            .filter(|id| !id.is_empty())
    }

    pub fn container_name(&self) -> Option<&str> {
        self.container_name
            .as_deref()
            .or_else(|| self.metadata.get(CONTAINER_NAME_KEY).map(String::as_str))
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname
            .as_deref()
            .or_else(|| self.metadata.get(HOSTNAME_KEY).map(String::as_str))
    }

    /// Non-blank schema text, if any.
    pub fn schema(&self) -> Option<&str> {
        self.json_schema.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Copy of this record with only `enabled` changed.
    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }
}

/// Input to [`crate::ModuleRegistryEngine::register_module`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    pub module_name: String,
    pub implementation_id: String,
    pub host: String,
    pub port: u16,
    pub service_type: String,
    pub version: String,
    pub metadata: HashMap<String, String>,
    /// Defaults to `host` when empty.
    pub engine_host: String,
    /// Defaults to `port` when zero.
    pub engine_port: u16,
    pub json_schema: Option<String>,
}

impl RegisterRequest {
    pub fn new(module_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            module_name: module_name.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_implementation_id(mut self, id: impl Into<String>) -> Self {
        self.implementation_id = id.into();
        self
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_engine(mut self, host: impl Into<String>, port: u16) -> Self {
        self.engine_host = host.into();
        self.engine_port = port;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.json_schema = Some(schema.into());
        self
    }

    pub fn container_id(&self) -> Option<&str> {
        self.metadata
            .get(CONTAINER_ID_KEY)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn schema(&self) -> Option<&str> {
        self.json_schema.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Worst-case status across a module's health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HealthStatus::Passing => "PASSING",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// A registration paired with its catalog health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthStatus {
    pub registration: ModuleRegistration,
    pub status: HealthStatus,
    /// `false` when the catalog has no instance with this module id.
    pub exists_in_catalog: bool,
}

/// Outcome of one zombie-reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZombieCleanupResult {
    pub zombies_detected: usize,
    pub zombies_cleaned: usize,
    pub errors: Vec<String>,
}

impl ZombieCleanupResult {
    pub(crate) fn failed(message: impl std::fmt::Display) -> Self {
        Self {
            zombies_detected: 0,
            zombies_cleaned: 0,
            errors: vec![format!("Cleanup failed: {}", message)],
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleRegistration {
        ModuleRegistration {
            module_id: "echo-1a2b3c4d".into(),
            module_name: "echo".into(),
            implementation_id: "echo-impl".into(),
            host: "10.0.0.1".into(),
            port: 50051,
            service_type: "PipeStepProcessor".into(),
            version: "1.0.0".into(),
            metadata: HashMap::from([(CONTAINER_ID_KEY.to_string(), "c-42".to_string())]),
            registered_at: 1_700_000_000_000,
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
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["moduleId"], "echo-1a2b3c4d");
        assert_eq!(json["implementationId"], "echo-impl");
        assert_eq!(json["registeredAt"], 1_700_000_000_000i64);
        assert!(json.get("jsonSchema").is_none());
    }

    #[test]
    fn test_missing_enabled_defaults_true() {
        let json = r#"{
            "moduleId": "m-1", "moduleName": "m", "implementationId": "i",
            "host": "h", "port": 1, "serviceType": "t", "version": "v",
            "engineHost": "h", "enginePort": 1
        }"#;
        let record: ModuleRegistration = serde_json::from_str(json).unwrap();
        assert!(record.enabled);
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn test_container_id_falls_back_to_metadata() {
        let mut record = sample();
        assert_eq!(record.container_id(), Some("c-42"));

        record.container_id = Some("c-99".into());
        assert_eq!(record.container_id(), Some("c-99"));
    }

    #[test]
    fn test_with_enabled_changes_only_flag() {
        let record = sample();
        let disabled = record.with_enabled(false);
        assert!(!disabled.enabled);
        assert_eq!(disabled.with_enabled(true), record);
    }

    #[test]
    fn test_blank_schema_is_absent() {
        let request = RegisterRequest::new("echo", "h", 1).with_schema("   ");
        assert_eq!(request.schema(), None);
    }

    #[test]
    fn test_failed_cleanup_result() {
        let result = ZombieCleanupResult::failed("catalog down");
        assert_eq!(result.zombies_detected, 0);
        assert_eq!(result.errors, vec!["Cleanup failed: catalog down"]);
        assert!(!result.is_clean());
    }
}
