//! Top-level facade over the registry components.

mod builder;

pub use builder::ModuleHubBuilder;

use crate::config::HubConfig;
use crate::error::Result;
use crate::health::HealthEvaluator;
use crate::reconciler::ZombieReconciler;
use crate::registry::{
    ModuleRegistration, ModuleRegistryEngine, RegisterRequest, ServiceHealthStatus,
    ZombieCleanupResult,
};
use crate::scheduler::CleanupScheduler;
use crate::watch::{ChangeEvent, ChangeWatcher};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// A wired registry: engine, health evaluator, reconciler, scheduler and
/// change watcher sharing one KV store and one catalog.
pub struct ModuleHub {
    pub(crate) config: HubConfig,
    pub(crate) engine: Arc<ModuleRegistryEngine>,
    pub(crate) health: HealthEvaluator,
    pub(crate) reconciler: Arc<ZombieReconciler>,
    pub(crate) scheduler: CleanupScheduler,
    pub(crate) watcher: Arc<ChangeWatcher>,
}

impl ModuleHub {
    pub fn builder(config: HubConfig) -> ModuleHubBuilder {
        ModuleHubBuilder::new(config)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ModuleRegistryEngine> {
        &self.engine
    }

    pub fn health(&self) -> &HealthEvaluator {
        &self.health
    }

    pub fn reconciler(&self) -> &Arc<ZombieReconciler> {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &CleanupScheduler {
        &self.scheduler
    }

    pub fn watcher(&self) -> &Arc<ChangeWatcher> {
        &self.watcher
    }

    /// Schedule the watcher start and start the cleanup timer.
    pub fn start(&self) {
        self.watcher.start_after_grace_period();
        self.scheduler.start();
        info!("Module hub started");
    }

    /// Stop every background task.
    pub fn shutdown(&self) {
        self.watcher.stop_watching();
        self.scheduler.stop();
        info!("Module hub stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.watcher.subscribe()
    }

    pub async fn register_module(&self, request: RegisterRequest) -> Result<ModuleRegistration> {
        self.engine.register_module(request).await
    }

    pub async fn list_registered_modules(&self) -> Vec<ModuleRegistration> {
        self.engine.list_registered_modules().await
    }

    pub async fn list_enabled_modules(&self) -> Vec<ModuleRegistration> {
        self.engine.list_enabled_modules().await
    }

    pub async fn get_module(&self, module_id: &str) -> Option<ModuleRegistration> {
        self.engine.get_module(module_id).await
    }

    pub async fn enable_module(&self, module_id: &str) -> bool {
        self.engine.enable_module(module_id).await
    }

    pub async fn disable_module(&self, module_id: &str) -> bool {
        self.engine.disable_module(module_id).await
    }

    pub async fn deregister_module(&self, module_id: &str) -> Result<()> {
        self.engine.deregister_module(module_id).await
    }

    pub async fn archive_service(&self, service_name: &str, reason: &str) -> bool {
        self.engine.archive_service(service_name, reason).await
    }

    pub async fn get_module_health_status(&self, module_id: &str) -> Result<ServiceHealthStatus> {
        self.health.get_module_health_status(module_id).await
    }

    pub async fn cleanup_zombie_instances(&self) -> ZombieCleanupResult {
        self.reconciler.cleanup_zombie_instances().await
    }

    pub async fn cleanup_stale_whitelisted_modules(&self) -> usize {
        self.reconciler.cleanup_stale_whitelisted_modules().await
    }
}
