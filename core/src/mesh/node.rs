//! Nodes, elements and models of the network configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::address::{Address, MeshAddress};
use crate::crypto::Key128;
use crate::keys::{hex_key, KeyIndex};

/// Publish TTL value meaning "use the node's default TTL".
pub const PUBLISH_TTL_DEFAULT: u8 = 0xFF;

/// SIG model identifiers are 16 bits; vendor models carry the company
/// identifier in the upper half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub u32);

impl ModelId {
    pub const CONFIGURATION_SERVER: ModelId = ModelId(0x0000);
    pub const CONFIGURATION_CLIENT: ModelId = ModelId(0x0001);
    pub const GENERIC_ON_OFF_SERVER: ModelId = ModelId(0x1000);
    pub const GENERIC_ON_OFF_CLIENT: ModelId = ModelId(0x1001);

    pub fn sig(id: u16) -> Self {
        ModelId(u32::from(id))
    }

    pub fn vendor(company: u16, id: u16) -> Self {
        ModelId((u32::from(company) << 16) | u32::from(id))
    }

    pub fn is_vendor(self) -> bool {
        self.0 > 0xFFFF
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_vendor() {
            write!(f, "{:#010x}", self.0)
        } else {
            write!(f, "{:#06x}", self.0)
        }
    }
}

/// Retransmission of published messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retransmit {
    pub count: u8,
    pub interval_ms: u16,
}

impl Retransmit {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.interval_ms))
    }
}

/// Repetition of every Network PDU sent by the node on an advertising bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTransmit {
    pub count: u8,
    pub interval_ms: u16,
}

impl NetworkTransmit {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.interval_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    #[serde(default)]
    pub relay: bool,
    #[serde(default)]
    pub proxy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publish {
    pub address: MeshAddress,
    pub app_key_index: KeyIndex,
    #[serde(default = "default_publish_ttl")]
    pub ttl: u8,
    /// Periodic publication interval in milliseconds; 0 disables it.
    #[serde(default)]
    pub period_ms: u64,
    #[serde(default)]
    pub retransmit: Retransmit,
}

fn default_publish_ttl() -> u8 {
    PUBLISH_TTL_DEFAULT
}

impl Publish {
    pub fn new(address: MeshAddress, app_key_index: KeyIndex) -> Self {
        Self {
            address,
            app_key_index,
            ttl: PUBLISH_TTL_DEFAULT,
            period_ms: 0,
            retransmit: Retransmit::default(),
        }
    }

    pub fn period(&self) -> Option<Duration> {
        (self.period_ms > 0).then(|| Duration::from_millis(self.period_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub model_id: ModelId,
    #[serde(default)]
    pub bind: Vec<KeyIndex>,
    #[serde(default)]
    pub subscribe: Vec<MeshAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<Publish>,
}

impl Model {
    pub fn new(model_id: ModelId) -> Self {
        Self {
            model_id,
            bind: Vec::new(),
            subscribe: Vec::new(),
            publish: None,
        }
    }

    pub fn is_bound_to(&self, app_key_index: KeyIndex) -> bool {
        self.bind.contains(&app_key_index)
    }

    pub fn is_subscribed_to(&self, address: Address) -> bool {
        self.subscribe.iter().any(|s| s.address == address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    #[serde(default)]
    pub location: u16,
    #[serde(default)]
    pub models: Vec<Model>,
}

impl Element {
    pub fn new(models: Vec<Model>) -> Self {
        Self {
            location: 0,
            models,
        }
    }

    pub fn model(&self, model_id: ModelId) -> Option<&Model> {
        self.models.iter().find(|m| m.model_id == model_id)
    }

    pub fn model_mut(&mut self, model_id: ModelId) -> Option<&mut Model> {
        self.models.iter_mut().find(|m| m.model_id == model_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub name: String,
    pub unicast_address: Address,
    #[serde(default, with = "hex_key::option", skip_serializing_if = "Option::is_none")]
    pub device_key: Option<Key128>,
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub network_keys: Vec<KeyIndex>,
    #[serde(default)]
    pub application_keys: Vec<KeyIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_transmit: Option<NetworkTransmit>,
    #[serde(default)]
    pub features: Features,
}

impl Node {
    pub fn new(name: impl Into<String>, unicast_address: Address, elements: Vec<Element>) -> Self {
        Self {
            name: name.into(),
            unicast_address,
            device_key: None,
            elements,
            network_keys: Vec::new(),
            application_keys: Vec::new(),
            default_ttl: None,
            network_transmit: None,
            features: Features::default(),
        }
    }

    pub fn element_count(&self) -> usize {
        self.elements.len().max(1)
    }

    pub fn last_unicast_address(&self) -> Address {
        self.unicast_address
            .offset((self.element_count() - 1) as u8)
    }

    pub fn contains_element(&self, address: Address) -> bool {
        address >= self.unicast_address && address <= self.last_unicast_address()
    }

    pub fn element_index(&self, address: Address) -> Option<usize> {
        self.contains_element(address)
            .then(|| usize::from(address.0 - self.unicast_address.0))
    }

    /// Elements paired with their unicast addresses.
    pub fn elements_with_addresses(&self) -> impl Iterator<Item = (Address, &Element)> {
        let base = self.unicast_address;
        self.elements
            .iter()
            .enumerate()
            .map(move |(i, e)| (base.offset(i as u8), e))
    }

    pub fn knows_network_key(&self, index: KeyIndex) -> bool {
        self.network_keys.contains(&index)
    }
}
