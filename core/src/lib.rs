// btmesh core: Bluetooth Mesh network and transport layers
//
// Bearer  -> network layer (encryption, relay, beacons, proxy configuration)
//         -> lower transport (replay protection, segmentation, acknowledgments)
//         -> upper transport (access encryption, per-destination queues)
//         -> access layer (validation, TIDs, acknowledged messages, publication)
//         -> model delegates
//
// All protocol state lives on one processing task; see `manager`.

pub mod address;
pub mod bearer;
pub mod config;
pub mod crypto;
pub mod effect;
pub mod keys;
pub mod layers;
pub mod manager;
pub mod mesh;
pub mod message;
pub mod models;
pub mod pdu;
pub mod proxy_filter;
pub mod replay;
pub mod sar;
pub mod store;
pub mod transaction;

use thiserror::Error;

pub use address::{Address, MeshAddress};
pub use bearer::{Bearer, BearerDelegate, BearerError, BearerKind, MemoryBearer, MemoryMedium, PduType};
pub use config::{ConfigError, NetworkParameters};
pub use crypto::CryptoError;
pub use keys::{ApplicationKey, IvIndex, KeyIndex, KeyRefreshPhase, NetworkKey};
pub use layers::access::{RequestKey, Route};
pub use layers::upper::ReceivedAccess;
pub use layers::AccessError;
pub use manager::{
    Delivery, ManagerOptions, MeshEvent, MeshNetworkManager, MessageHandle, SendTarget,
};
pub use mesh::{Element, MeshNetwork, Model, ModelId, NetworkError, Node};
pub use message::{MeshMessage, MessageContext, ModelDelegate, ModelError};
pub use pdu::{Heartbeat, PduError, ProxyFilterType};
pub use proxy_filter::ProxyFilterSetup;
pub use replay::ReplayPolicy;
pub use sar::LowerTransportError;
pub use store::{MemoryStorage, SledStorage, Storage, StorageError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Every error the stack reports, by the layer it comes from.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("Cryptography error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Malformed PDU: {0}")]
    Pdu(#[from] PduError),

    #[error("Bearer error: {0}")]
    Bearer(#[from] BearerError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Lower transport error: {0}")]
    LowerTransport(#[from] LowerTransportError),

    #[error("Invalid network parameters: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network configuration error: {0}")]
    Network(#[from] NetworkError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("A wait for this opcode and source is already pending")]
    WaitAlreadyPending,

    #[error("Mesh network manager is not running")]
    Shutdown,
}

/// Installs a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
/// Calling it again is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
