//! Error types for the module registry.
//!
//! Registration failures are surfaced to callers with distinct variants so a
//! front end can map them to its own status codes. Store failures on read
//! paths are recovered locally and never reach this type's callers.

use thiserror::Error;

/// Main error type for the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    // Validation errors
    #[error("Invalid JSON Schema (draft-07) for module '{module_name}': {reason}")]
    InvalidSchema { module_name: String, reason: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Conflict errors
    #[error(
        "Container {container_id} is already registered as module '{existing_module}'. \
         Cannot register the same container under multiple module names."
    )]
    DuplicateContainer {
        container_id: String,
        existing_module: String,
    },

    #[error("A module is already registered at {host}:{port}")]
    EndpointConflict { host: String, port: u16 },

    #[error("Schema mismatch for module '{module_name}'. All instances must have the same schema.")]
    SchemaMismatch { module_name: String },

    // Connectivity errors
    #[error("Cannot connect to module {module_name} at {host}:{port}")]
    Unreachable {
        module_name: String,
        host: String,
        port: u16,
    },

    #[error("Module not found: {module_id}")]
    NotFound { module_id: String },

    // Store errors
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Request to {target} timed out")]
    Timeout { target: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Coarse classification of a [`RegistryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input. Never retried.
    Validation,
    /// Duplicate endpoint/container or schema mismatch. Never retried automatically.
    Conflict,
    /// Module connectivity probe failed. Caller may retry.
    Unreachable,
    /// The requested module does not exist.
    NotFound,
    /// KV or catalog I/O failure.
    Store,
    /// Anything else (configuration, internal).
    Internal,
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RegistryError::Timeout {
                target: err
                    .url()
                    .map(|url| url.to_string())
                    .unwrap_or_else(|| "the Consul agent".to_string()),
            }
        } else {
            RegistryError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl RegistryError {
    /// Create a store error from anything displayable.
    pub fn store(message: impl Into<String>) -> Self {
        RegistryError::Store {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RegistryError::InvalidSchema { .. } | RegistryError::Validation { .. } => {
                ErrorClass::Validation
            }

            RegistryError::DuplicateContainer { .. }
            | RegistryError::EndpointConflict { .. }
            | RegistryError::SchemaMismatch { .. } => ErrorClass::Conflict,

            RegistryError::Unreachable { .. } => ErrorClass::Unreachable,

            RegistryError::NotFound { .. } => ErrorClass::NotFound,

            RegistryError::Store { .. }
            | RegistryError::Network { .. }
            | RegistryError::Timeout { .. }
            | RegistryError::Json { .. } => ErrorClass::Store,

            RegistryError::Config { .. } | RegistryError::Other(_) => ErrorClass::Internal,
        }
    }

    /// Check if the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Store { .. }
                | RegistryError::Network { .. }
                | RegistryError::Timeout { .. }
                | RegistryError::Unreachable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::EndpointConflict {
            host: "10.0.0.1".into(),
            port: 50051,
        };
        assert_eq!(
            err.to_string(),
            "A module is already registered at 10.0.0.1:50051"
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            RegistryError::SchemaMismatch {
                module_name: "echo".into()
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            RegistryError::InvalidSchema {
                module_name: "echo".into(),
                reason: "bad".into()
            }
            .class(),
            ErrorClass::Validation
        );
        assert_eq!(RegistryError::store("down").class(), ErrorClass::Store);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RegistryError::Timeout {
            target: "http://localhost:8500/v1/kv/pipeline".into()
        }
        .is_retryable());
        assert!(RegistryError::Unreachable {
            module_name: "echo".into(),
            host: "h".into(),
            port: 1
        }
        .is_retryable());
        assert!(!RegistryError::DuplicateContainer {
            container_id: "c1".into(),
            existing_module: "echo".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_timeout_message_names_target() {
        let err = RegistryError::Timeout {
            target: "http://localhost:8500/v1/agent/services".into(),
        };
        assert_eq!(
            err.to_string(),
            "Request to http://localhost:8500/v1/agent/services timed out"
        );
    }

    #[tokio::test]
    async fn test_http_timeout_keeps_request_url() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer
        let _server = tokio::spawn(async move {
            let _conn = listener.accept().await;
            std::future::pending::<()>().await;
        });

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(50))
            .build()
            .unwrap();
        let err = client
            .get(format!("http://{}/v1/kv/pipeline", addr))
            .send()
            .await
            .unwrap_err();

        match RegistryError::from(err) {
            RegistryError::Timeout { target } => assert!(target.ends_with("/v1/kv/pipeline")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
