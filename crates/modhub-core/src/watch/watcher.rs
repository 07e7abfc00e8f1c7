//! Long-poll watches over the registry and pipeline namespaces.

use super::cursor::WatchCursor;
use super::events::ChangeEvent;
use crate::config::{RegistryConfig, WatchConfig};
use crate::error::Result;
use crate::kv::{KvListing, KvStore, PrefixWatch};
use crate::retry::RetryConfig;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The namespaces a [`ChangeWatcher`] follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    PipelineDefinitions,
    ModuleRegistrations,
    ClusterPipelines,
}

impl WatchKind {
    pub const ALL: [WatchKind; 3] = [
        WatchKind::PipelineDefinitions,
        WatchKind::ModuleRegistrations,
        WatchKind::ClusterPipelines,
    ];

    /// Watched prefix, with trailing slash.
    pub fn prefix(&self, kv_prefix: &str, cluster_name: &str) -> String {
        match self {
            WatchKind::PipelineDefinitions => format!(
                "{}/{}/{}/",
                kv_prefix,
                WatchConfig::PIPELINES_KEY,
                WatchConfig::DEFINITIONS_KEY
            ),
            WatchKind::ModuleRegistrations => {
                format!("{}/{}/", kv_prefix, RegistryConfig::MODULES_NAMESPACE)
            }
            WatchKind::ClusterPipelines => format!(
                "{}/{}/{}/{}/",
                kv_prefix,
                WatchConfig::CLUSTERS_KEY,
                cluster_name,
                WatchConfig::PIPELINES_KEY
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub kv_prefix: String,
    pub cluster_name: String,
    pub enabled: bool,
    pub startup_delay: Duration,
    /// Blocking-query wait per round.
    pub wait: Duration,
}

/// Per-prefix state shared with the watch loop.
struct PrefixHandler {
    kind: WatchKind,
    prefix: String,
    cluster_name: String,
    cursor: Arc<Mutex<WatchCursor>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl PrefixHandler {
    fn handle_round(&self, round: Result<KvListing>) -> usize {
        match round {
            Ok(listing) => self.handle_listing(&listing),
            Err(e) => {
                warn!("Watch round on {} failed, retrying: {}", self.prefix, e);
                0
            }
        }
    }

    fn handle_listing(&self, listing: &KvListing) -> usize {
        if !lock(&self.cursor).observe(&self.prefix, listing.index) {
            debug!(
                "Index {} unchanged for {}, skipping",
                listing.index, self.prefix
            );
            return 0;
        }

        let mut emitted = 0;
        for entry in &listing.entries {
            let Some(id) = first_segment(&entry.key, &self.prefix) else {
                continue;
            };
            let event = match self.kind {
                WatchKind::PipelineDefinitions => {
                    if entry.key.ends_with(WatchConfig::METADATA_SUFFIX) {
                        continue;
                    }
                    ChangeEvent::PipelineDefinitionChanged {
                        pipeline_id: id.to_string(),
                        value: entry.value.clone(),
                    }
                }
                WatchKind::ModuleRegistrations => ChangeEvent::ModuleRegistrationChanged {
                    module_id: id.to_string(),
                    value: entry.value.clone(),
                },
                WatchKind::ClusterPipelines => ChangeEvent::ClusterPipelineChanged {
                    cluster: self.cluster_name.clone(),
                    pipeline_id: id.to_string(),
                    value: entry.value.clone(),
                },
            };
            // No receivers is fine
            let _ = self.events.send(event);
            emitted += 1;
        }

        debug!(
            "Emitted {} change events for {} at index {}",
            emitted, self.prefix, listing.index
        );
        emitted
    }
}

/// First path segment of `key` after `prefix`, if non-empty.
fn first_segment<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turns KV mutations into [`ChangeEvent`]s for subscribers.
///
/// The watcher is either stopped or running one watch per [`WatchKind`].
/// Both transitions are idempotent, and stopping forgets every index seen.
pub struct ChangeWatcher {
    kv: Arc<dyn KvStore>,
    settings: WatchSettings,
    backoff: RetryConfig,
    events: broadcast::Sender<ChangeEvent>,
    cursor: Arc<Mutex<WatchCursor>>,
    watches: Mutex<Vec<PrefixWatch>>,
    grace: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeWatcher {
    pub fn new(kv: Arc<dyn KvStore>, settings: WatchSettings) -> Self {
        let (events, _) = broadcast::channel(WatchConfig::EVENT_CHANNEL_CAPACITY);
        Self {
            kv,
            settings: WatchSettings {
                kv_prefix: settings.kv_prefix.trim_matches('/').to_string(),
                ..settings
            },
            backoff: RetryConfig::new()
                .with_base_delay(WatchConfig::RECONNECT_BASE_DELAY)
                .with_max_delay(WatchConfig::RECONNECT_MAX_DELAY),
            events,
            cursor: Arc::new(Mutex::new(WatchCursor::new())),
            watches: Mutex::new(Vec::new()),
            grace: Mutex::new(None),
        }
    }

    /// Override the reconnect back-off of the underlying watches.
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub fn prefix_for(&self, kind: WatchKind) -> String {
        kind.prefix(&self.settings.kv_prefix, &self.settings.cluster_name)
    }

    fn handler(&self, kind: WatchKind) -> PrefixHandler {
        PrefixHandler {
            kind,
            prefix: self.prefix_for(kind),
            cluster_name: self.settings.cluster_name.clone(),
            cursor: self.cursor.clone(),
            events: self.events.clone(),
        }
    }

    /// Start one watch per namespace. Does nothing if already running.
    pub fn start_watching(&self) {
        let mut watches = lock(&self.watches);
        if !watches.is_empty() {
            debug!("Change watcher already running");
            return;
        }

        for kind in WatchKind::ALL {
            let handler = self.handler(kind);
            let prefix = handler.prefix.clone();
            info!("Starting watch on {}", prefix);
            watches.push(PrefixWatch::spawn(
                self.kv.clone(),
                prefix,
                self.settings.wait,
                self.backoff.clone(),
                move |round| {
                    handler.handle_round(round);
                },
            ));
        }
        info!("Change watcher started with {} watches", watches.len());
    }

    /// Cancel every watch and forget the last-seen indexes.
    pub fn stop_watching(&self) {
        if let Some(pending) = lock(&self.grace).take() {
            pending.abort();
        }

        let stopped: Vec<PrefixWatch> = lock(&self.watches).drain(..).collect();
        if stopped.is_empty() {
            return;
        }
        for watch in &stopped {
            debug!("Stopping watch on {}", watch.prefix());
            watch.stop();
        }
        lock(&self.cursor).reset();
        info!("Change watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.watches).is_empty()
    }

    pub fn active_watch_count(&self) -> usize {
        lock(&self.watches).len()
    }

    /// Start watching after the configured startup delay.
    ///
    /// Skipped when watching is disabled. If the watcher was started in the
    /// meantime the delayed start does nothing.
    pub fn start_after_grace_period(self: &Arc<Self>) {
        if !self.settings.enabled {
            debug!("Change watching disabled, not scheduling start");
            return;
        }
        if self.is_running() {
            return;
        }

        let mut grace = lock(&self.grace);
        if grace.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Delayed watcher start already scheduled");
            return;
        }

        let weak = Arc::downgrade(self);
        let delay = self.settings.startup_delay;
        info!("Change watcher will start in {:?}", delay);
        *grace = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(watcher) = weak.upgrade() {
                if !watcher.is_running() {
                    watcher.start_watching();
                }
            }
        }));
    }

    /// Process one listing for `kind` as if a watch round had returned it.
    /// Returns the number of events emitted.
    pub fn process_listing(&self, kind: WatchKind, listing: &KvListing) -> usize {
        self.handler(kind).handle_listing(listing)
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop_watching();
    }
}
