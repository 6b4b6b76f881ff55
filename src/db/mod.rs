//! Observation storage.
//!
//! Append-only persistence backed by Elasticsearch or SQLite.

mod elastic;
#[cfg(test)]
pub(crate) mod memory;
mod models;
mod sqlite;
mod store;

pub use elastic::*;
pub use models::*;
pub use sqlite::*;
pub use store::*;

use std::sync::Arc;

use crate::config::{ServerConfig, StoreKind};

/// Build the store selected by the configuration.
pub fn open_store(cfg: &ServerConfig) -> Result<ObservationStore, StoreError> {
    let backend: Arc<dyn ObservationBackend> = match cfg.store {
        StoreKind::Elasticsearch => Arc::new(ElasticsearchBackend::new(
            &cfg.es_url(),
            &cfg.es_index,
            cfg.store_timeout,
        )?),
        StoreKind::Sqlite => Arc::new(SqliteBackend::open(&cfg.db_path)?),
    };
    Ok(ObservationStore::new(backend, cfg.store_timeout))
}
