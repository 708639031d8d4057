//! Mesh addresses.
//!
//! | Range            | Kind                          |
//! |------------------|-------------------------------|
//! | 0x0000           | unassigned                    |
//! | 0x0001..=0x7FFF  | unicast                       |
//! | 0x8000..=0xBFFF  | virtual (hash of a Label UUID)|
//! | 0xC000..=0xFEFF  | group                         |
//! | 0xFF00..=0xFFFF  | fixed / reserved groups       |

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::crypto;

/// 16-bit mesh address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u16);

impl Address {
    pub const UNASSIGNED: Address = Address(0x0000);
    pub const ALL_IPV6_BORDER_ROUTERS: Address = Address(0xFFFB);
    pub const ALL_PROXIES: Address = Address(0xFFFC);
    pub const ALL_FRIENDS: Address = Address(0xFFFD);
    pub const ALL_RELAYS: Address = Address(0xFFFE);
    pub const ALL_NODES: Address = Address(0xFFFF);
    /// Source used for proxy configuration messages when the local node has no address.
    pub const MAX_UNICAST: Address = Address(0x7FFF);

    pub fn is_unassigned(self) -> bool {
        self.0 == 0x0000
    }

    pub fn is_unicast(self) -> bool {
        (0x0001..=0x7FFF).contains(&self.0)
    }

    pub fn is_virtual(self) -> bool {
        (0x8000..=0xBFFF).contains(&self.0)
    }

    /// Group addresses, including the fixed groups.
    pub fn is_group(self) -> bool {
        (0xC000..=0xFEFF).contains(&self.0) || self.is_special_group()
    }

    pub fn is_special_group(self) -> bool {
        self.0 >= 0xFFFB
    }

    /// Group or virtual; anything a subscription can match.
    pub fn is_multicast(self) -> bool {
        self.is_group() || self.is_virtual()
    }

    pub fn is_valid_destination(self) -> bool {
        self.is_unicast() || self.is_multicast()
    }

    /// Address of the element `index` positions after this one.
    pub fn offset(self, index: u8) -> Address {
        Address(self.0.wrapping_add(index as u16))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Address(value)
    }
}

impl From<Address> for u16 {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// A destination: the 16-bit address plus, for virtual addresses, the
/// Label UUID it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAddress {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_label: Option<Uuid>,
}

impl MeshAddress {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            virtual_label: None,
        }
    }

    /// Virtual address computed from its Label UUID.
    pub fn from_label(label: Uuid) -> Self {
        let address = Address(crypto::virtual_address(label.as_bytes()));
        Self {
            address,
            virtual_label: Some(label),
        }
    }

    /// Label bytes used as additional authenticated data.
    pub fn label_bytes(&self) -> Option<[u8; 16]> {
        self.virtual_label.map(|uuid| *uuid.as_bytes())
    }
}

impl From<Address> for MeshAddress {
    fn from(address: Address) -> Self {
        MeshAddress::new(address)
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.virtual_label {
            Some(label) => write!(f, "{} ({})", self.address, label),
            None => write!(f, "{}", self.address),
        }
    }
}
