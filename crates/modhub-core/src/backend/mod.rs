//! Store backends implementing [`KvStore`](crate::kv::KvStore) and
//! [`ServiceCatalog`](crate::catalog::ServiceCatalog).

mod consul;
mod memory;

pub use consul::ConsulBackend;
pub use memory::InMemoryBackend;
