//! Chronicle DB - redb implementation of storage traits.

pub mod blob_store;
pub mod log_store;
pub mod media_store;
pub mod tables;

pub use blob_store::RedbBlobBackend;
pub use log_store::RedbPartitionStore;

use std::path::Path;
use std::sync::Arc;

use redb::Database;

use chronicle_core::StorageError;

/// Initialize a database with all required tables.
pub fn init_database(path: impl AsRef<Path>) -> Result<Arc<Database>, StorageError> {
    let db = Database::create(path).map_err(|e| StorageError::Database(e.to_string()))?;

    RedbPartitionStore::init_tables(&db)?;
    RedbBlobBackend::init_tables(&db)?;

    Ok(Arc::new(db))
}
