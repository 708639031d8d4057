//! The protocol layers between the bearer and the models.
//!
//! Every layer is a plain state machine. Receive paths return what goes up;
//! send paths and timers push [`Effect`](crate::effect::Effect)s that the
//! engine executes.

pub mod access;
pub mod lower;
pub mod network;
pub mod upper;

use thiserror::Error;

use crate::address::Address;
use crate::keys::KeyIndex;
use crate::mesh::ModelId;

pub use access::AccessLayer;
pub use lower::LowerTransportLayer;
pub use network::NetworkLayer;
pub use upper::{AccessKey, Security, UpperTransportLayer};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Request errors, reported synchronously before any traffic is generated,
/// plus the terminal states of an acknowledged exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Source address {0} is not an element of the local node")]
    InvalidSource(Address),

    #[error("Local node has no element {0}")]
    InvalidElement(Address),

    #[error("Invalid TTL {0}: must be 0 or in 2..=127")]
    InvalidTtl(u8),

    #[error("Invalid destination {0}")]
    InvalidDestination(Address),

    #[error("Model {model} is not bound to application key {key}")]
    ModelNotBoundToAppKey { model: ModelId, key: KeyIndex },

    #[error("Model {0} is not bound to any application key")]
    ModelNotBound(ModelId),

    #[error("No model {model} on element {element}")]
    ModelNotFound { element: Address, model: ModelId },

    #[error("Model {0} has no publication configured")]
    NoPublication(ModelId),

    #[error("Device key of {0} is unknown")]
    NoDeviceKey(Address),

    #[error("Messages with TTL 1 are not relayed by the proxy")]
    CannotRelay,

    #[error("The connected proxy does not know network key {0}")]
    NoCommonKeyWithProxy(KeyIndex),

    #[error("Key {0} not found")]
    KeyNotFound(KeyIndex),

    #[error("Sequence numbers of {0} exhausted; an IV Index update is required")]
    SequenceExhausted(Address),

    #[error("No response received in time")]
    Timeout,

    #[error("Message cancelled")]
    Cancelled,
}
