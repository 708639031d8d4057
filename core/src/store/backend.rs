// Storage backends for the network document

use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

use super::{Storage, StorageError};

const NETWORK_KEY: &[u8] = b"mesh_network";

/// In-memory storage, for tests and short-lived managers.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<Option<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().clone())
    }

    fn save(&self, data: &[u8]) -> Result<(), StorageError> {
        *self.data.write() = Some(data.to_vec());
        Ok(())
    }
}

/// Storage in a sled database; the document lives under one key.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl Storage for SledStorage {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .db
            .get(NETWORK_KEY)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn save(&self, data: &[u8]) -> Result<(), StorageError> {
        self.db
            .insert(NETWORK_KEY, data)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
