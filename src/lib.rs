//! Chronicle node: a replica registry over a redb database.

pub mod config;

use std::sync::Arc;

use chronicle_core::StorageError;
use chronicle_db::{init_database, RedbBlobBackend, RedbPartitionStore};
use chronicle_replica::{RegistryConfig, ReplicaRegistry, TokioSleeper, Upstream};

pub use config::{Config, ConfigError};

/// Open the database at `config.db_path` and build a registry over it.
pub fn open_registry(
    config: &Config,
    upstream: Option<Arc<dyn Upstream>>,
) -> Result<ReplicaRegistry, StorageError> {
    let db = init_database(&config.db_path)?;
    let registry_config = RegistryConfig {
        inline_threshold: config.inline_threshold,
        retry_policy: Arc::new(config.backoff()),
        sleeper: Arc::new(TokioSleeper),
    };
    Ok(ReplicaRegistry::new(
        Arc::new(RedbBlobBackend::new(db.clone())),
        Arc::new(RedbPartitionStore::new(db)),
        upstream,
        registry_config,
    ))
}
