use std::sync::Arc;

use redb::{Database, ReadableTable};

use chronicle_core::{BlobBackend, BlobMeta, ContentHash, StorageError};

use crate::tables::{BUFFERS_TABLE, BVOBS_TABLE};

/// redb implementation of BlobBackend.
pub struct RedbBlobBackend {
    db: Arc<Database>,
}

impl RedbBlobBackend {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Initialize the database tables.
    pub fn init_tables(db: &Database) -> Result<(), StorageError> {
        let write_txn = db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        {
            let _ = write_txn
                .open_table(BVOBS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let _ = write_txn
                .open_table(BUFFERS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }
}

impl BlobBackend for RedbBlobBackend {
    fn get_meta(&self, content_hash: &ContentHash) -> Result<Option<BlobMeta>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(BVOBS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        match table
            .get(content_hash.as_str())
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            Some(value) => {
                let meta: BlobMeta = serde_json::from_slice(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    fn all_meta(&self) -> Result<Vec<BlobMeta>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(BVOBS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut metas = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            let (_, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            let meta: BlobMeta = serde_json::from_slice(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            metas.push(meta);
        }

        Ok(metas)
    }

    fn put(&self, meta: &BlobMeta, buffer: &[u8]) -> Result<(), StorageError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        {
            let mut bvobs = write_txn
                .open_table(BVOBS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let mut buffers = write_txn
                .open_table(BUFFERS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;

            let value =
                serde_json::to_vec(meta).map_err(|e| StorageError::Serialization(e.to_string()))?;
            bvobs
                .insert(meta.content_hash.as_str(), value.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            buffers
                .insert(meta.content_hash.as_str(), buffer)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    fn read_buffer(&self, content_hash: &ContentHash) -> Result<Option<Vec<u8>>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(BUFFERS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let buffer = table
            .get(content_hash.as_str())
            .map_err(|e| StorageError::Database(e.to_string()))?
            .map(|value| value.value().to_vec());

        Ok(buffer)
    }

    fn adjust_persist_refs(
        &self,
        deltas: &[(ContentHash, i64)],
    ) -> Result<Vec<BlobMeta>, StorageError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut updated = Vec::new();
        {
            let mut table = write_txn
                .open_table(BVOBS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;

            for (hash, delta) in deltas {
                let existing = table
                    .get(hash.as_str())
                    .map_err(|e| StorageError::Database(e.to_string()))?
                    .map(|value| value.value().to_vec());

                // Records that were never written have nothing to count
                let Some(existing) = existing else {
                    continue;
                };
                let mut meta: BlobMeta = serde_json::from_slice(&existing)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                meta.adjust(*delta);

                let value = serde_json::to_vec(&meta)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                table
                    .insert(hash.as_str(), value.as_slice())
                    .map_err(|e| StorageError::Database(e.to_string()))?;
                updated.push(meta);
            }
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(updated)
    }

    fn delete(&self, hashes: &[ContentHash]) -> Result<(), StorageError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        {
            let mut bvobs = write_txn
                .open_table(BVOBS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let mut buffers = write_txn
                .open_table(BUFFERS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;

            for hash in hashes {
                bvobs
                    .remove(hash.as_str())
                    .map_err(|e| StorageError::Database(e.to_string()))?;
                buffers
                    .remove(hash.as_str())
                    .map_err(|e| StorageError::Database(e.to_string()))?;
            }
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_backend() -> RedbBlobBackend {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("test.redb")).unwrap();
        RedbBlobBackend::init_tables(&db).unwrap();
        RedbBlobBackend::new(Arc::new(db))
    }

    #[test]
    fn test_put_and_read() {
        let backend = create_test_backend();
        let hash = ContentHash::of(b"hello");

        backend.put(&BlobMeta::new(hash.clone(), 5, 0), b"hello").unwrap();

        let meta = backend.get_meta(&hash).unwrap().unwrap();
        assert_eq!(meta.byte_length, 5);
        assert_eq!(meta.persist_ref_count, 0);
        assert_eq!(backend.read_buffer(&hash).unwrap().unwrap(), b"hello".to_vec());
    }

    #[test]
    fn test_missing_blob() {
        let backend = create_test_backend();
        let hash = ContentHash::of(b"missing");

        assert!(backend.get_meta(&hash).unwrap().is_none());
        assert!(backend.read_buffer(&hash).unwrap().is_none());
    }

    #[test]
    fn test_adjust_persist_refs() {
        let backend = create_test_backend();
        let hello = ContentHash::of(b"hello");
        let world = ContentHash::of(b"world");
        backend.put(&BlobMeta::new(hello.clone(), 5, 1), b"hello").unwrap();
        backend.put(&BlobMeta::new(world.clone(), 5, 0), b"world").unwrap();

        let updated = backend
            .adjust_persist_refs(&[
                (hello.clone(), 2),
                (world.clone(), -3),
                (ContentHash::of(b"unknown"), 1),
            ])
            .unwrap();

        assert_eq!(updated.len(), 2);
        assert_eq!(backend.get_meta(&hello).unwrap().unwrap().persist_ref_count, 3);
        assert_eq!(backend.get_meta(&world).unwrap().unwrap().persist_ref_count, 0);
    }

    #[test]
    fn test_delete_removes_meta_and_buffer() {
        let backend = create_test_backend();
        let hash = ContentHash::of(b"hello");
        backend.put(&BlobMeta::new(hash.clone(), 5, 0), b"hello").unwrap();

        backend.delete(&[hash.clone()]).unwrap();

        assert!(backend.get_meta(&hash).unwrap().is_none());
        assert!(backend.read_buffer(&hash).unwrap().is_none());
        assert!(backend.all_meta().unwrap().is_empty());
    }
}
