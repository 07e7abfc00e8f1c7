//! Long-poll watch over a key prefix.

use super::{KvListing, KvStore};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::retry::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// A running blocking-query loop over one prefix.
///
/// Every completed round, successful or not, is handed to the handler. After
/// a failed round the loop backs off using its [`RetryConfig`] and issues a
/// fresh query; callers never reconnect themselves.
pub struct PrefixWatch {
    prefix: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PrefixWatch {
    /// Spawn the loop on the current runtime.
    pub fn spawn<F>(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        wait: Duration,
        backoff: RetryConfig,
        mut handler: F,
    ) -> Self
    where
        F: FnMut(Result<KvListing>) + Send + 'static,
    {
        let prefix = prefix.into();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task_prefix = prefix.clone();

        let handle = tokio::spawn(async move {
            let mut index = 0u64;
            let mut failures = 0u32;

            while !task_token.is_cancelled() {
                let round = tokio::select! {
                    _ = task_token.cancelled() => break,
                    round = kv.list_prefix_blocking(&task_prefix, index, wait) => round,
                };

                match round {
                    Ok(listing) => {
                        failures = 0;
                        // An index that goes backwards means the store was reset
                        index = if listing.index < index { 0 } else { listing.index };
                        handler(Ok(listing));
                    }
                    Err(e) => {
                        let delay = backoff.delay_for(failures);
                        failures = failures.saturating_add(1);
                        handler(Err(e));
                        if !task_token.sleep(delay).await {
                            break;
                        }
                    }
                }
            }

            debug!("Watch loop for {} exited", task_prefix);
        });

        Self {
            prefix,
            token,
            handle,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Cancel the loop. Any in-flight query is dropped.
    pub fn stop(&self) {
        self.token.cancel();
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PrefixWatch {
    fn drop(&mut self) {
        self.stop();
    }
}
