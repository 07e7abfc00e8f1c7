//! Module registry: data model, persistence and lifecycle engine.

mod engine;
pub mod schema;
mod store;
mod types;
mod validator;

pub use engine::{EngineSettings, ModuleRegistryEngine};
pub use store::RegistryStore;
pub use types::{
    HealthStatus, ModuleRegistration, RegisterRequest, ServiceHealthStatus, ZombieCleanupResult,
    CONTAINER_ID_KEY, CONTAINER_NAME_KEY, HOSTNAME_KEY, UNKNOWN,
};
pub use validator::{ConnectionValidator, TcpConnectionValidator};
