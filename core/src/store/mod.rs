//! Persistence of the mesh network document.
//!
//! The stack stores one opaque blob: the JSON form of [`MeshNetwork`]. Where
//! it ends up is the backend's business.

pub mod backend;

use thiserror::Error;
use tracing::debug;

use crate::mesh::MeshNetwork;
use crate::MeshError;

pub use backend::{MemoryStorage, SledStorage};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend failed: {0}")]
    Backend(String),
}

/// Load/save of the configuration blob.
#[cfg_attr(test, mockall::automock)]
pub trait Storage: Send + Sync {
    /// The last saved blob, if any.
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError>;

    fn save(&self, data: &[u8]) -> Result<(), StorageError>;
}

/// Reads the network document, if one was saved.
pub fn load_network(storage: &dyn Storage) -> Result<Option<MeshNetwork>, MeshError> {
    match storage.load()? {
        Some(data) => Ok(Some(MeshNetwork::from_json(&data)?)),
        None => Ok(None),
    }
}

pub fn save_network(storage: &dyn Storage, network: &MeshNetwork) -> Result<(), MeshError> {
    let data = network.to_json()?;
    storage.save(&data)?;
    debug!(bytes = data.len(), "Network configuration saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[test]
    fn test_save_then_load() {
        let storage = MemoryStorage::new();
        assert!(load_network(&storage).unwrap().is_none());

        let mut network = MeshNetwork::new("home");
        network.sequence_numbers.insert(Address(0x0001), 64);
        save_network(&storage, &network).unwrap();

        let loaded = load_network(&storage).unwrap().unwrap();
        assert_eq!(loaded.uuid, network.uuid);
        assert_eq!(loaded.sequence_numbers.get(&Address(0x0001)), Some(&64));
    }

    #[test]
    fn test_backend_failure_is_reported() {
        let mut storage = MockStorage::new();
        storage
            .expect_save()
            .times(1)
            .returning(|_| Err(StorageError::Backend("disk full".into())));
        let result = save_network(&storage, &MeshNetwork::new("home"));
        assert!(matches!(result, Err(MeshError::Storage(StorageError::Backend(_)))));
    }

    #[test]
    fn test_corrupt_document() {
        let mut storage = MockStorage::new();
        storage
            .expect_load()
            .returning(|| Ok(Some(b"not json".to_vec())));
        assert!(matches!(load_network(&storage), Err(MeshError::Network(_))));
    }
}
