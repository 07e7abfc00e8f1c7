//! Reachability probe run before a module is admitted.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Decides whether a module endpoint accepts connections.
#[async_trait]
pub trait ConnectionValidator: Send + Sync {
    async fn validate_connection(&self, host: &str, port: u16, module_name: &str) -> bool;
}

/// Opens a TCP connection to the endpoint and closes it again.
#[derive(Debug, Clone)]
pub struct TcpConnectionValidator {
    timeout: Duration,
}

impl TcpConnectionValidator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionValidator for TcpConnectionValidator {
    async fn validate_connection(&self, host: &str, port: u16, module_name: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                debug!("Module {} reachable at {}:{}", module_name, host, port);
                true
            }
            Ok(Err(e)) => {
                warn!(
                    "Module {} at {}:{} refused connection: {}",
                    module_name, host, port, e
                );
                false
            }
            Err(_) => {
                warn!(
                    "Connection to module {} at {}:{} timed out after {:?}",
                    module_name, host, port, self.timeout
                );
                false
            }
        }
    }
}
