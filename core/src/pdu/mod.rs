//! Wire codecs for every PDU the stack handles.
//!
//! Codecs are pure: no state, no keys beyond those passed in. Malformed input
//! yields a [`PduError`], never a panic.

pub mod access;
pub mod beacon;
pub mod heartbeat;
pub mod lower;
pub mod network;
pub mod proxy;
pub mod upper;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::address::Address;
use crate::crypto::CryptoError;

pub use access::AccessPdu;
pub use beacon::SecureNetworkBeacon;
pub use heartbeat::Heartbeat;
pub use lower::{LowerTransportPdu, Segment, SegmentAcknowledgment, SegmentKind};
pub use network::{NetworkPdu, NonceType};
pub use proxy::{ProxyConfigurationMessage, ProxyFilterType};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PduError {
    #[error("PDU too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("PDU too long: at most {max} bytes, got {actual}")]
    TooLong { max: usize, actual: usize },

    #[error("Reserved opcode {0:#04x}")]
    ReservedOpcode(u32),

    #[error("Invalid opcode {0:#x}")]
    InvalidOpcode(u32),

    #[error("Invalid segment: SegO {seg_o} > SegN {seg_n}")]
    InvalidSegment { seg_o: u8, seg_n: u8 },

    #[error("NID mismatch")]
    NidMismatch,

    #[error("No IV Index matches IVI {0}")]
    IvIndexMismatch(u8),

    #[error("Invalid source address {0}")]
    InvalidSource(Address),

    #[error("Invalid {0}")]
    InvalidField(&'static str),

    #[error("Unsupported beacon type {0:#04x}")]
    UnsupportedBeacon(u8),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub(crate) fn ensure_len(data: &[u8], expected: usize) -> Result<(), PduError> {
    if data.len() < expected {
        return Err(PduError::TooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

// ============================================================================
// PDU TYPE
// ============================================================================

/// Kind of payload a bearer carries. The value is the proxy protocol
/// message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PduType {
    NetworkPdu = 0x00,
    MeshBeacon = 0x01,
    ProxyConfiguration = 0x02,
    ProvisioningPdu = 0x03,
}

impl PduType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PduType::NetworkPdu),
            0x01 => Some(PduType::MeshBeacon),
            0x02 => Some(PduType::ProxyConfiguration),
            0x03 => Some(PduType::ProvisioningPdu),
            _ => None,
        }
    }
}

impl fmt::Display for PduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PduType::NetworkPdu => write!(f, "Network PDU"),
            PduType::MeshBeacon => write!(f, "Mesh Beacon"),
            PduType::ProxyConfiguration => write!(f, "Proxy Configuration"),
            PduType::ProvisioningPdu => write!(f, "Provisioning PDU"),
        }
    }
}
