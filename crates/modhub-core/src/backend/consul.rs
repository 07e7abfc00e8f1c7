//! Consul agent HTTP backend.
//!
//! Implements [`KvStore`] over `/v1/kv` and [`ServiceCatalog`] over the
//! agent, catalog and health endpoints. Idempotent reads are retried with
//! back-off; blocking queries are not, since the watch loop owns their retry.

use crate::catalog::{
    CatalogService, CatalogServiceSummary, CheckStatus, ServiceCatalog, ServiceHealthEntry,
    ServiceRegistration,
};
use crate::config::{ConsulSettings, NetworkConfig};
use crate::error::{RegistryError, Result};
use crate::kv::{KvEntry, KvListing, KvStore};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client for a single Consul agent.
pub struct ConsulBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
    retry: RetryConfig,
}

impl ConsulBackend {
    pub fn new(settings: &ConsulSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| RegistryError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self {
            client,
            base_url: settings.base_url(),
            token: settings.token.clone().filter(|t| !t.is_empty()),
            datacenter: settings.datacenter.clone().filter(|dc| !dc.is_empty()),
            retry: RetryConfig::default(),
        })
    }

    /// Replace the retry policy used for idempotent reads.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.header(NetworkConfig::CONSUL_TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.datacenter {
            builder = builder.query(&[("dc", dc)]);
        }
        builder
    }

    /// GET with retry. `Ok(None)` on 404.
    async fn http_get(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<Response>> {
        self.retry
            .run(path, move || async move {
                let response = self
                    .request(Method::GET, path)
                    .query(query)
                    .send()
                    .await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                check_status(response, path).await.map(Some)
            })
            .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        match self.http_get(path, query).await? {
            Some(response) => Ok(Some(response.json::<T>().await?)),
            None => Ok(None),
        }
    }

    async fn http_put(&self, path: &str, body: PutBody) -> Result<()> {
        let builder = self.request(Method::PUT, path);
        let builder = match body {
            PutBody::Raw(raw) => builder.body(raw),
            PutBody::Json(value) => builder.json(&value),
        };
        let response = builder.send().await?;
        check_status(response, path).await.map(|_| ())
    }
}

/// `X-Consul-Index` of a blocking query, floored at 1. A missing or zero
/// index would turn every following round into a non-blocking query.
fn response_index(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(NetworkConfig::CONSUL_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        .max(1)
}

enum PutBody {
    Raw(String),
    Json(serde_json::Value),
}

async fn check_status(response: Response, path: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::store(format!(
        "Consul returned {} for {}: {}",
        status,
        path,
        body.trim()
    )))
}

/// Build `/v1/kv/...`, percent-encoding each key segment.
pub(crate) fn kv_path(key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("/v1/kv/{}", encoded.join("/"))
}

fn format_consul_duration(duration: Duration) -> String {
    format!("{}s", duration.as_secs().max(1))
}

#[derive(Debug, Deserialize)]
struct RawKvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

fn decode_entries(raw: Vec<RawKvEntry>) -> Vec<KvEntry> {
    let engine = base64::engine::general_purpose::STANDARD;
    raw.into_iter()
        .filter_map(|entry| {
            let bytes = match entry.value {
                Some(encoded) => match engine.decode(encoded.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Skipping undecodable value at {}: {}", entry.key, e);
                        return None;
                    }
                },
                None => Vec::new(),
            };
            match String::from_utf8(bytes) {
                Ok(value) => Some(KvEntry {
                    key: entry.key,
                    value,
                }),
                Err(_) => {
                    warn!("Skipping non-UTF-8 value at {}", entry.key);
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct AgentCheck<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "GRPC")]
    grpc: &'a str,
    #[serde(rename = "GRPCUseTLS")]
    grpc_use_tls: bool,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

#[derive(Debug, Serialize)]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: &'a [String],
    #[serde(rename = "Meta")]
    meta: &'a HashMap<String, String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    check: Option<AgentCheck<'a>>,
}

fn registration_body(registration: &ServiceRegistration) -> Result<serde_json::Value> {
    let body = AgentServiceRegistration {
        id: &registration.id,
        name: &registration.name,
        address: &registration.address,
        port: registration.port,
        tags: &registration.tags,
        meta: &registration.meta,
        check: registration.check.as_ref().map(|check| AgentCheck {
            name: &check.name,
            grpc: &check.grpc,
            grpc_use_tls: check.grpc_use_tls,
            interval: format_consul_duration(check.interval),
            deregister_critical_service_after: format_consul_duration(
                check.deregister_critical_after,
            ),
        }),
    };
    Ok(serde_json::to_value(body)?)
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthCheck {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawHealthEntry {
    #[serde(rename = "Node")]
    node: Option<HealthNode>,
    #[serde(rename = "Service")]
    service: HealthService,
    #[serde(rename = "Checks", default)]
    checks: Vec<HealthCheck>,
}

impl RawHealthEntry {
    fn into_entry(self) -> ServiceHealthEntry {
        let address = if self.service.address.is_empty() {
            self.node.map(|n| n.address).unwrap_or_default()
        } else {
            self.service.address
        };
        ServiceHealthEntry {
            service: CatalogService {
                id: self.service.id,
                name: self.service.service,
                address,
                port: self.service.port,
                tags: self.service.tags.unwrap_or_default(),
                meta: self.service.meta.unwrap_or_default(),
            },
            checks: self
                .checks
                .iter()
                .map(|check| CheckStatus::parse(&check.status))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCatalogService {
    #[serde(rename = "ServiceID")]
    service_id: String,
    #[serde(rename = "ServiceName")]
    service_name: String,
    #[serde(rename = "ServiceAddress", default)]
    service_address: String,
    #[serde(rename = "Address", default)]
    node_address: String,
    #[serde(rename = "ServicePort", default)]
    service_port: u16,
    #[serde(rename = "ServiceTags", default)]
    service_tags: Option<Vec<String>>,
    #[serde(rename = "ServiceMeta", default)]
    service_meta: Option<HashMap<String, String>>,
}

impl From<RawCatalogService> for CatalogService {
    fn from(raw: RawCatalogService) -> Self {
        let address = if raw.service_address.is_empty() {
            raw.node_address
        } else {
            raw.service_address
        };
        CatalogService {
            id: raw.service_id,
            name: raw.service_name,
            address,
            port: raw.service_port,
            tags: raw.service_tags.unwrap_or_default(),
            meta: raw.service_meta.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl KvStore for ConsulBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.http_get(&kv_path(key), &[("raw", "")]).await? {
            Some(response) => Ok(Some(response.text().await?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.http_put(&kv_path(key), PutBody::Raw(value.to_string()))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = kv_path(key);
        let response = self.request(Method::DELETE, &path).send().await?;
        check_status(response, &path).await.map(|_| ())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .get_json::<Vec<String>>(&kv_path(prefix), &[("keys", "")])
            .await?
            .unwrap_or_default())
    }

    async fn list_prefix_blocking(
        &self,
        prefix: &str,
        after_index: u64,
        wait: Duration,
    ) -> Result<KvListing> {
        let path = kv_path(prefix);
        let index = after_index.to_string();
        let wait_param = format_consul_duration(wait);

        let mut builder = self
            .request(Method::GET, &path)
            .query(&[("recurse", "")])
            // The agent adds up to wait/16 of jitter before answering
            .timeout(wait + wait / 16 + NetworkConfig::REQUEST_TIMEOUT);
        if after_index > 0 {
            builder = builder.query(&[("index", index.as_str()), ("wait", wait_param.as_str())]);
        }

        let response = builder.send().await?;
        let new_index = response_index(response.headers());

        if response.status() == StatusCode::NOT_FOUND {
            debug!("No keys under {} (index {})", prefix, new_index);
            return Ok(KvListing {
                index: new_index,
                entries: Vec::new(),
            });
        }

        let response = check_status(response, &path).await?;
        let raw: Vec<RawKvEntry> = response.json().await?;
        Ok(KvListing {
            index: new_index,
            entries: decode_entries(raw),
        })
    }
}

#[async_trait]
impl ServiceCatalog for ConsulBackend {
    async fn register(&self, registration: ServiceRegistration) -> Result<()> {
        let body = registration_body(&registration)?;
        self.http_put("/v1/agent/service/register", PutBody::Json(body))
            .await
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let path = format!(
            "/v1/agent/service/deregister/{}",
            urlencoding::encode(service_id)
        );
        let response = self.request(Method::PUT, &path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Service {} already absent from agent", service_id);
            return Ok(());
        }
        check_status(response, &path).await.map(|_| ())
    }

    async fn list_services(&self, tag: Option<&str>) -> Result<Vec<CatalogServiceSummary>> {
        let filter = tag.map(|t| format!("\"{}\" in ServiceTags", t));
        let query: Vec<(&str, &str)> = match &filter {
            Some(f) => vec![("filter", f.as_str())],
            None => Vec::new(),
        };

        let services: HashMap<String, Vec<String>> = self
            .get_json("/v1/catalog/services", &query)
            .await?
            .unwrap_or_default();

        let mut summaries: Vec<CatalogServiceSummary> = services
            .into_iter()
            .filter(|(_, tags)| tag.map_or(true, |t| tags.iter().any(|x| x == t)))
            .map(|(name, tags)| CatalogServiceSummary { name, tags })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    async fn health_for_service(&self, service_name: &str) -> Result<Vec<ServiceHealthEntry>> {
        let path = format!("/v1/health/service/{}", urlencoding::encode(service_name));
        let raw: Vec<RawHealthEntry> = self.get_json(&path, &[]).await?.unwrap_or_default();
        Ok(raw.into_iter().map(RawHealthEntry::into_entry).collect())
    }

    async fn service_instances(&self, service_name: &str) -> Result<Vec<CatalogService>> {
        let path = format!("/v1/catalog/service/{}", urlencoding::encode(service_name));
        let raw: Vec<RawCatalogService> = self.get_json(&path, &[]).await?.unwrap_or_default();
        Ok(raw.into_iter().map(CatalogService::from).collect())
    }

    async fn local_service_ids(&self) -> Result<Vec<String>> {
        let services: HashMap<String, serde_json::Value> = self
            .get_json("/v1/agent/services", &[])
            .await?
            .unwrap_or_default();
        let mut ids: Vec<String> = services.into_keys().collect();
        ids.sort();
        Ok(ids)
    }
}
