mod memory;
mod sqlite;

use std::sync::Arc;

use tessera_core::config::{StoreBackend, StoreConfig};
use tessera_core::error::Result;
use tessera_core::traits::Store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Build the store selected by `config`.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.resolved_path())?)),
    }
}
