//! Periodic driver for the zombie reconciler.

use crate::cancel::CancellationToken;
use crate::reconciler::ZombieReconciler;
use crate::registry::ZombieCleanupResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub initial_delay: Duration,
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs both reconciliation passes on a fixed interval.
pub struct CleanupScheduler {
    reconciler: Arc<ZombieReconciler>,
    enabled: Arc<AtomicBool>,
    interval: Duration,
    initial_delay: Duration,
    task: Mutex<Option<RunningTask>>,
}

impl CleanupScheduler {
    pub fn new(reconciler: Arc<ZombieReconciler>, settings: SchedulerSettings) -> Self {
        Self {
            reconciler,
            enabled: Arc::new(AtomicBool::new(settings.enabled)),
            interval: settings.interval,
            initial_delay: settings.initial_delay,
            task: Mutex::new(None),
        }
    }

    /// Toggle whether scheduled ticks do any work. The timer keeps running.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start the timer. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Cleanup scheduler already running");
            return false;
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let reconciler = self.reconciler.clone();
        let enabled = self.enabled.clone();
        let interval = self.interval;
        let start = Instant::now() + self.initial_delay;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !enabled.load(Ordering::SeqCst) {
                    debug!("Scheduled cleanup is disabled, skipping");
                    continue;
                }

                let (result, stale) = run_passes(&reconciler).await;
                log_outcome(&result, stale);
            }
            debug!("Cleanup scheduler stopped");
        });

        info!(
            "Cleanup scheduler started (first run in {:?}, then every {:?})",
            self.initial_delay, self.interval
        );
        *task = Some(RunningTask { token, handle });
        true
    }

    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(running) = task.take() {
            running.token.cancel();
            running.handle.abort();
            info!("Cleanup scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Run both passes now, regardless of the enabled flag.
    pub async fn run_once(&self) -> (ZombieCleanupResult, usize) {
        let (result, stale) = run_passes(&self.reconciler).await;
        log_outcome(&result, stale);
        (result, stale)
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_passes(reconciler: &ZombieReconciler) -> (ZombieCleanupResult, usize) {
    let result = reconciler.cleanup_zombie_instances().await;
    let stale = reconciler.cleanup_stale_whitelisted_modules().await;
    (result, stale)
}

fn log_outcome(result: &ZombieCleanupResult, stale: usize) {
    if result.is_clean() {
        info!(
            "Scheduled cleanup: {} zombies detected, {} cleaned, {} stale registrations removed",
            result.zombies_detected, result.zombies_cleaned, stale
        );
    } else {
        warn!(
            "Scheduled cleanup finished with errors: {} detected, {} cleaned, errors: {:?}",
            result.zombies_detected, result.zombies_cleaned, result.errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::catalog::{ServiceCatalog, ServiceRegistration};
    use crate::health::HealthCache;
    use crate::registry::{
        ConnectionValidator, EngineSettings, ModuleRegistryEngine, RegistryStore,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct AlwaysReachable;

    #[async_trait]
    impl ConnectionValidator for AlwaysReachable {
        async fn validate_connection(&self, _host: &str, _port: u16, _name: &str) -> bool {
            true
        }
    }

    fn scheduler(backend: Arc<InMemoryBackend>, enabled: bool) -> CleanupScheduler {
        let engine = Arc::new(ModuleRegistryEngine::new(
            RegistryStore::new(backend.clone(), "pipeline", 4),
            backend,
            Arc::new(AlwaysReachable),
            EngineSettings::default(),
            HealthCache::new(Duration::from_secs(10)),
        ));
        CleanupScheduler::new(
            Arc::new(ZombieReconciler::new(engine, 4)),
            SchedulerSettings {
                enabled,
                interval: Duration::from_secs(1800),
                initial_delay: Duration::from_secs(60),
            },
        )
    }

    async fn add_orphan(backend: &InMemoryBackend, id: &str) {
        backend
            .register(ServiceRegistration {
                id: id.into(),
                name: "orphan".into(),
                address: "10.0.0.5".into(),
                port: 7000,
                tags: vec!["module".into()],
                meta: HashMap::new(),
                check: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_once_cleans_orphan() {
        let backend = Arc::new(InMemoryBackend::new());
        add_orphan(&backend, "orphan-1").await;

        let (result, stale) = scheduler(backend.clone(), false).run_once().await;
        assert_eq!(result.zombies_detected, 1);
        assert_eq!(result.zombies_cleaned, 1);
        assert_eq!(stale, 0);
        assert!(!backend.has_service("orphan-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_waits_for_initial_delay() {
        let backend = Arc::new(InMemoryBackend::new());
        add_orphan(&backend, "orphan-1").await;
        let scheduler = scheduler(backend.clone(), true);

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(backend.has_service("orphan-1"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!backend.has_service("orphan-1"));

        scheduler.stop();
        tokio::task::yield_now().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_flag_skips_runs() {
        let backend = Arc::new(InMemoryBackend::new());
        add_orphan(&backend, "orphan-1").await;
        let scheduler = scheduler(backend.clone(), false);

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(backend.has_service("orphan-1"));

        scheduler.set_enabled(true);
        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert!(!backend.has_service("orphan-1"));
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_keeps_timer_alive() {
        let backend = Arc::new(InMemoryBackend::new());
        let scheduler = scheduler(backend.clone(), true);
        backend.set_catalog_failing(true);

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(scheduler.is_running());

        backend.set_catalog_failing(false);
        add_orphan(&backend, "orphan-2").await;
        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert!(!backend.has_service("orphan-2"));
        scheduler.stop();
    }
}
