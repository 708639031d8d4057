//! Bearer abstraction
//!
//! A bearer moves opaque, boundary-preserving byte buffers between the stack
//! and the radio. Connection management and characteristic I/O live behind
//! this trait; the stack only opens, closes and sends.

pub mod gatt;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use crate::pdu::PduType;
pub use gatt::ProxyProtocolHandler;
pub use memory::{BearerKind, MemoryBearer, MemoryMedium};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BearerError {
    #[error("Bearer is closed")]
    Closed,

    #[error("Bearer does not support {0}")]
    Unsupported(PduType),

    #[error("Bearer I/O failed: {0}")]
    Io(String),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Receiver of bearer state changes and inbound PDUs.
///
/// Called from the bearer's own task; implementations must not block.
pub trait BearerDelegate: Send + Sync {
    fn bearer_did_open(&self);

    /// The bearer closed, with the failure that caused it if any.
    fn bearer_did_close(&self, error: Option<BearerError>);

    fn bearer_did_deliver(&self, data: Vec<u8>, pdu_type: PduType);
}

#[async_trait]
pub trait Bearer: Send + Sync {
    async fn open(&self) -> Result<(), BearerError>;

    async fn close(&self) -> Result<(), BearerError>;

    /// Queues `data` for transmission without waiting for the radio.
    fn send(&self, data: &[u8], pdu_type: PduType) -> Result<(), BearerError>;

    fn supports(&self, pdu_type: PduType) -> bool;

    fn is_open(&self) -> bool;

    fn set_delegate(&self, delegate: Arc<dyn BearerDelegate>);

    /// A bearer carrying proxy configuration messages is a GATT connection to
    /// a proxy node.
    fn is_gatt(&self) -> bool {
        self.supports(PduType::ProxyConfiguration)
    }
}
