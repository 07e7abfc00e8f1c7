//! Centralized configuration for the module registry.
//!
//! Compile-time defaults live as associated constants on unit structs.
//! Runtime settings are collected in [`HubConfig`], which can be loaded from a
//! camelCase JSON file where every field is optional.

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Registry-level defaults.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const DEFAULT_KV_PREFIX: &'static str = "pipeline";
    pub const DEFAULT_CLUSTER_NAME: &'static str = "default";
    pub const MODULES_NAMESPACE: &'static str = "modules/global";
    pub const ARCHIVE_NAMESPACE: &'static str = "archive/services";
    pub const MODULE_TAG: &'static str = "module";
    pub const GLOBAL_TAG: &'static str = "global";
    pub const SERVICE_TYPE_META: &'static str = "MODULE";
    pub const HEALTH_CHECK_NAME: &'static str = "Module gRPC Health Check";
    pub const MODULE_ID_SUFFIX_LEN: usize = 8;

    pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEREGISTER_AFTER: Duration = Duration::from_secs(60);
    pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(10);
    pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
    pub const FANOUT_LIMIT: usize = 16;
    pub const MAX_CACHED_MODULES: u64 = 1024;

    // Reconciliation schedule
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);
    pub const CLEANUP_INITIAL_DELAY: Duration = Duration::from_secs(60);
}

/// Change-watcher defaults.
pub struct WatchConfig;

impl WatchConfig {
    pub const PIPELINES_KEY: &'static str = "pipelines";
    pub const DEFINITIONS_KEY: &'static str = "definitions";
    pub const CLUSTERS_KEY: &'static str = "clusters";
    pub const METADATA_SUFFIX: &'static str = "/metadata";
    pub const STARTUP_DELAY: Duration = Duration::from_secs(10);
    pub const BLOCKING_WAIT: Duration = Duration::from_secs(300);
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
}

/// Network-related defaults for the Consul backend.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const DEFAULT_CONSUL_HOST: &'static str = "localhost";
    pub const DEFAULT_CONSUL_PORT: u16 = 8500;
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const USER_AGENT: &'static str = "modhub/0.3";
    pub const CONSUL_INDEX_HEADER: &'static str = "X-Consul-Index";
    pub const CONSUL_TOKEN_HEADER: &'static str = "X-Consul-Token";
}

/// Connection settings for the Consul agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsulSettings {
    pub host: String,
    pub port: u16,
    /// Use HTTPS for the agent connection.
    pub secure: bool,
    /// ACL token sent as `X-Consul-Token`.
    pub token: Option<String>,
    pub datacenter: Option<String>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            host: NetworkConfig::DEFAULT_CONSUL_HOST.to_string(),
            port: NetworkConfig::DEFAULT_CONSUL_PORT,
            secure: false,
            token: None,
            datacenter: None,
            timeout: NetworkConfig::REQUEST_TIMEOUT,
        }
    }
}

impl ConsulSettings {
    /// Base URL of the agent HTTP API, without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Runtime configuration for a [`crate::ModuleHub`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// Root of every key this registry reads or writes.
    pub kv_prefix: String,
    /// Cluster whose pipeline configs are watched.
    pub cluster_name: String,
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_secs")]
    pub deregister_after: Duration,
    #[serde(with = "duration_secs")]
    pub health_cache_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    pub cleanup_enabled: bool,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_initial_delay: Duration,
    pub watch_enabled: bool,
    #[serde(with = "duration_secs")]
    pub watch_startup_delay: Duration,
    #[serde(with = "duration_secs")]
    pub watch_wait: Duration,
    /// Upper bound on concurrent store calls within one fan-out.
    pub fanout_limit: usize,
    pub consul: ConsulSettings,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            kv_prefix: RegistryConfig::DEFAULT_KV_PREFIX.to_string(),
            cluster_name: RegistryConfig::DEFAULT_CLUSTER_NAME.to_string(),
            health_check_interval: RegistryConfig::HEALTH_CHECK_INTERVAL,
            deregister_after: RegistryConfig::DEREGISTER_AFTER,
            health_cache_ttl: RegistryConfig::HEALTH_CACHE_TTL,
            connection_timeout: RegistryConfig::CONNECTION_TIMEOUT,
            cleanup_enabled: true,
            cleanup_interval: RegistryConfig::CLEANUP_INTERVAL,
            cleanup_initial_delay: RegistryConfig::CLEANUP_INITIAL_DELAY,
            watch_enabled: true,
            watch_startup_delay: WatchConfig::STARTUP_DELAY,
            watch_wait: WatchConfig::BLOCKING_WAIT,
            fanout_limit: RegistryConfig::FANOUT_LIMIT,
            consul: ConsulSettings::default(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RegistryError::Config {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;
        let config: HubConfig =
            serde_json::from_str(&contents).map_err(|e| RegistryError::Config {
                message: format!("Failed to parse config file {}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the registry cannot run with.
    pub fn validate(&self) -> Result<()> {
        let prefix = self.kv_prefix.trim_matches('/');
        if prefix.is_empty() {
            return Err(RegistryError::Config {
                message: "kvPrefix must not be empty".to_string(),
            });
        }
        if self.cluster_name.trim().is_empty() {
            return Err(RegistryError::Config {
                message: "clusterName must not be empty".to_string(),
            });
        }
        if self.fanout_limit == 0 {
            return Err(RegistryError::Config {
                message: "fanoutLimit must be at least 1".to_string(),
            });
        }
        if self.cleanup_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(RegistryError::Config {
                message: "cleanupInterval and healthCheckInterval must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// KV prefix with surrounding slashes removed.
    pub fn normalized_prefix(&self) -> &str {
        self.kv_prefix.trim_matches('/')
    }
}

/// Serde adapter writing a `Duration` as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.normalized_prefix(), "pipeline");
        assert_eq!(config.consul.base_url(), "http://localhost:8500");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"kvPrefix": "/rokkon/", "cleanupInterval": 120, "consul": {{"port": 8501, "secure": true}}}}"#
        )
        .unwrap();

        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.normalized_prefix(), "rokkon");
        assert_eq!(config.cleanup_interval, Duration::from_secs(120));
        assert_eq!(config.consul.base_url(), "https://localhost:8501");
        assert!(config.watch_enabled);
    }

    #[test]
    fn test_validation_rejects_zero_fanout() {
        let config = HubConfig {
            fanout_limit: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = HubConfig::load("/nonexistent/modhub.json");
        assert!(matches!(result, Err(RegistryError::Config { .. })));
    }
}
