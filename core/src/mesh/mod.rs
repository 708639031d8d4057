//! Network configuration: keys, nodes, groups and the IV Index.
//!
//! `MeshNetwork` is the document persisted through [`crate::store::Storage`]
//! as JSON. The processing engine owns the only mutable copy at runtime.

pub mod node;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::address::{Address, MeshAddress};
use crate::keys::{ApplicationKey, IvIndex, KeyIndex, NetworkKey};
use crate::replay::ReplayEntry;

pub use node::{
    Element, Features, Model, ModelId, NetworkTransmit, Node, Publish, Retransmit,
    PUBLISH_TTL_DEFAULT,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("No Network Key with index {0}")]
    NoNetworkKey(KeyIndex),
    #[error("No Application Key with index {0}")]
    NoApplicationKey(KeyIndex),
    #[error("Local node has no unicast address")]
    NoLocalNode,
    #[error("Invalid network document: {0}")]
    InvalidDocument(String),
}

/// A named group address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    pub address: MeshAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshNetwork {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub iv_index: IvIndex,
    #[serde(default)]
    pub network_keys: Vec<NetworkKey>,
    #[serde(default)]
    pub application_keys: Vec<ApplicationKey>,
    /// The node this stack runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_node: Option<Node>,
    /// Remote nodes, for device keys and element lookups.
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Next reserved sequence number per local element.
    #[serde(default)]
    pub sequence_numbers: HashMap<Address, u32>,
    /// Last accepted SeqAuth values per source.
    #[serde(default)]
    pub replay_protection: HashMap<Address, ReplayEntry>,
}

impl MeshNetwork {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            iv_index: IvIndex::default(),
            network_keys: Vec::new(),
            application_keys: Vec::new(),
            local_node: None,
            nodes: Vec::new(),
            groups: Vec::new(),
            sequence_numbers: HashMap::new(),
            replay_protection: HashMap::new(),
        }
    }

    pub fn from_json(data: &[u8]) -> Result<Self, NetworkError> {
        serde_json::from_slice(data).map_err(|e| NetworkError::InvalidDocument(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, NetworkError> {
        serde_json::to_vec_pretty(self).map_err(|e| NetworkError::InvalidDocument(e.to_string()))
    }

    pub fn network_key(&self, index: KeyIndex) -> Option<&NetworkKey> {
        self.network_keys.iter().find(|k| k.index == index)
    }

    pub fn network_key_mut(&mut self, index: KeyIndex) -> Option<&mut NetworkKey> {
        self.network_keys.iter_mut().find(|k| k.index == index)
    }

    pub fn application_key(&self, index: KeyIndex) -> Option<&ApplicationKey> {
        self.application_keys.iter().find(|k| k.index == index)
    }

    pub fn local_node(&self) -> Option<&Node> {
        self.local_node.as_ref()
    }

    pub fn is_local_unicast(&self, address: Address) -> bool {
        self.local_node
            .as_ref()
            .map(|n| n.contains_element(address))
            .unwrap_or(false)
    }

    /// Any known node (local or remote) owning the given element address.
    pub fn node_with_address(&self, address: Address) -> Option<&Node> {
        self.local_node
            .iter()
            .chain(self.nodes.iter())
            .find(|n| n.contains_element(address))
    }

    /// Every known Label UUID hashing to `address`: groups, subscriptions
    /// and publications of the local node.
    pub fn virtual_labels(&self, address: Address) -> Vec<Uuid> {
        let mut labels: Vec<Uuid> = Vec::new();
        let mut push = |candidate: &MeshAddress| {
            if let Some(label) = candidate.virtual_label {
                if candidate.address == address && !labels.contains(&label) {
                    labels.push(label);
                }
            }
        };
        for group in &self.groups {
            push(&group.address);
        }
        if let Some(node) = &self.local_node {
            for model in node.elements.iter().flat_map(|e| e.models.iter()) {
                model.subscribe.iter().for_each(&mut push);
                if let Some(publish) = &model.publish {
                    push(&publish.address);
                }
            }
        }
        labels
    }

    /// Whether the local node is interested in a multicast destination.
    pub fn is_local_subscription(&self, address: Address) -> bool {
        if address == Address::ALL_NODES {
            return true;
        }
        self.local_node
            .as_ref()
            .map(|node| {
                node.elements
                    .iter()
                    .flat_map(|e| e.models.iter())
                    .any(|m| m.is_subscribed_to(address))
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> MeshNetwork {
        let mut network = MeshNetwork::new("home");
        network
            .network_keys
            .push(NetworkKey::new(0, [0x11; 16]));
        network
            .application_keys
            .push(ApplicationKey::new(0, [0x22; 16], 0));
        let label = Uuid::parse_str("0073E7E4-D8B9-440F-AF84-15DF4C56C0E1").unwrap();
        let mut model = Model::new(ModelId::GENERIC_ON_OFF_SERVER);
        model.bind.push(0);
        model.subscribe.push(MeshAddress::new(Address(0xC001)));
        model.subscribe.push(MeshAddress::from_label(label));
        network.local_node = Some(Node::new(
            "provisioner",
            Address(0x0001),
            vec![Element::new(vec![model])],
        ));
        network
    }

    #[test]
    fn test_lookups() {
        let network = network();
        assert!(network.network_key(0).is_some());
        assert!(network.application_key(1).is_none());
        assert!(network.is_local_unicast(Address(0x0001)));
        assert!(!network.is_local_unicast(Address(0x0002)));
        assert!(network.is_local_subscription(Address(0xC001)));
        assert!(network.is_local_subscription(Address::ALL_NODES));
        assert!(!network.is_local_subscription(Address(0xC002)));
        assert_eq!(network.virtual_labels(Address(0xB529)).len(), 1);
    }

    #[test]
    fn test_json_round_trip_keeps_keys_and_nodes() {
        let mut network = network();
        network.sequence_numbers.insert(Address(0x0001), 42);
        network.replay_protection.insert(
            Address(0x0005),
            ReplayEntry {
                last: 0x0100_0010,
                previous: 0x0100_0008,
            },
        );
        let json = network.to_json().unwrap();
        let restored = MeshNetwork::from_json(&json).unwrap();
        assert_eq!(restored.uuid, network.uuid);
        assert_eq!(restored.network_keys[0].derivatives().nid, network.network_keys[0].derivatives().nid);
        assert_eq!(restored.application_keys[0].aid(), network.application_keys[0].aid());
        assert_eq!(restored.local_node, network.local_node);
        assert_eq!(restored.sequence_numbers.get(&Address(0x0001)), Some(&42));
        assert_eq!(restored.replay_protection, network.replay_protection);
    }

    #[test]
    fn test_invalid_document() {
        assert!(matches!(
            MeshNetwork::from_json(b"{not json"),
            Err(NetworkError::InvalidDocument(_))
        ));
    }
}
