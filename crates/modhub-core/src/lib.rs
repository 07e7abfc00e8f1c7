//! Modhub Core - Headless module-registry consistency engine.
//!
//! Keeps a registry of processing modules consistent across a key/value
//! store and a service catalog with health checks. Registration writes both
//! stores, a reconciler repairs drift between them, and a change watcher
//! turns KV mutations into typed events. No HTTP layer is included.
//!
//! # Example
//!
//! ```rust,ignore
//! use modhub_core::{HubConfig, ModuleHub, RegisterRequest};
//!
//! #[tokio::main]
//! async fn main() -> modhub_core::Result<()> {
//!     let hub = ModuleHub::builder(HubConfig::load("modhub.json")?).build()?;
//!     hub.start();
//!
//!     let module = hub
//!         .register_module(RegisterRequest::new("echo", "10.0.0.1", 50051))
//!         .await?;
//!     println!("Registered {}", module.module_id);
//!
//!     let zombies = hub.cleanup_zombie_instances().await;
//!     println!("Cleaned {} zombies", zombies.zombies_cleaned);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod health;
pub mod kv;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod watch;

mod api;

// Re-export commonly used types
pub use api::{ModuleHub, ModuleHubBuilder};
pub use backend::{ConsulBackend, InMemoryBackend};
pub use cancel::CancellationToken;
pub use catalog::{
    CatalogService, CatalogServiceSummary, CheckStatus, HealthCheckSpec, ServiceCatalog,
    ServiceHealthEntry, ServiceRegistration,
};
pub use config::{ConsulSettings, HubConfig};
pub use error::{ErrorClass, RegistryError, Result};
pub use health::{HealthCache, HealthEvaluator};
pub use kv::{KvEntry, KvListing, KvStore, PrefixWatch};
pub use reconciler::{Zombie, ZombieKind, ZombieReconciler};
pub use registry::{
    ConnectionValidator, HealthStatus, ModuleRegistration, ModuleRegistryEngine, RegisterRequest,
    ServiceHealthStatus, TcpConnectionValidator, ZombieCleanupResult,
};
pub use retry::RetryConfig;
pub use scheduler::CleanupScheduler;
pub use watch::{ChangeEvent, ChangeWatcher, WatchCursor, WatchKind};
