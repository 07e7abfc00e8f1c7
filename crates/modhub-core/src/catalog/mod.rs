//! Service catalog and health-check capability.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// gRPC health check attached to a catalog registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub name: String,
    /// `host:port` probed with the gRPC health protocol.
    pub grpc: String,
    pub grpc_use_tls: bool,
    pub interval: Duration,
    /// Catalog drops the service after failing this long.
    pub deregister_critical_after: Duration,
}

/// A service instance to add to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub check: Option<HealthCheckSpec>,
}

/// A service instance as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

/// Status of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}

impl CheckStatus {
    /// Parse a catalog status string. Unrecognized values count as critical.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "passing" => CheckStatus::Passing,
            "warning" => CheckStatus::Warning,
            _ => CheckStatus::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance and the statuses of all checks bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHealthEntry {
    pub service: CatalogService,
    pub checks: Vec<CheckStatus>,
}

/// Service name and its union of tags, as returned by a catalog listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogServiceSummary {
    pub name: String,
    pub tags: Vec<String>,
}

/// Service registry with per-instance health checks.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn register(&self, registration: ServiceRegistration) -> Result<()>;

    /// Remove an instance. Unknown ids succeed.
    async fn deregister(&self, service_id: &str) -> Result<()>;

    /// Services carrying `tag`, or all services when `tag` is `None`.
    async fn list_services(&self, tag: Option<&str>) -> Result<Vec<CatalogServiceSummary>>;

    /// Instances of `service_name` together with their check statuses.
    async fn health_for_service(&self, service_name: &str) -> Result<Vec<ServiceHealthEntry>>;

    async fn service_instances(&self, service_name: &str) -> Result<Vec<CatalogService>>;

    /// Ids of every instance registered with the local agent.
    async fn local_service_ids(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_parse() {
        assert_eq!(CheckStatus::parse("passing"), CheckStatus::Passing);
        assert_eq!(CheckStatus::parse("Warning"), CheckStatus::Warning);
        assert_eq!(CheckStatus::parse("critical"), CheckStatus::Critical);
        assert_eq!(CheckStatus::parse("maintenance"), CheckStatus::Critical);
        assert_eq!(CheckStatus::parse(""), CheckStatus::Critical);
    }
}
