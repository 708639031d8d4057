//! Network keys, application keys, the IV Index and Key Refresh state.
//!
//! Keys are stored with their derived material so the hot receive path never
//! runs the KDF. During Key Refresh a key carries its previous value as well;
//! both are accepted on receive while only one is used on transmit.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, Key128};

/// Global key index, 12 bits.
pub type KeyIndex = u16;

/// Hex (de)serialization for 128-bit keys.
pub(crate) mod hex_key {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("key must be 16 bytes"))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            key: &Option<[u8; 16]>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match key {
                Some(key) => super::serialize(key, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<[u8; 16]>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "crate::keys::hex_key")] [u8; 16]);
            let value: Option<Wrapper> = Option::deserialize(deserializer)?;
            Ok(value.map(|Wrapper(key)| key))
        }
    }
}

// ============================================================================
// IV INDEX
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IvIndex {
    pub index: u32,
    pub update_active: bool,
}

impl IvIndex {
    pub fn new(index: u32, update_active: bool) -> Self {
        Self {
            index,
            update_active,
        }
    }

    /// IV Index used to encrypt outgoing PDUs. During the IV Update
    /// procedure nodes keep transmitting with the previous value.
    pub fn transmit_index(&self) -> u32 {
        if self.update_active && self.index > 0 {
            self.index - 1
        } else {
            self.index
        }
    }

    /// IV Index to use for a received PDU carrying the given IVI bit.
    pub fn receive_index(&self, ivi: u8) -> Option<u32> {
        if self.index & 1 == u32::from(ivi & 1) {
            Some(self.index)
        } else {
            self.index.checked_sub(1)
        }
    }
}

impl fmt::Display for IvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#010x}{}",
            self.index,
            if self.update_active { " (update active)" } else { "" }
        )
    }
}

// ============================================================================
// KEY REFRESH
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    #[default]
    NormalOperation,
    /// Phase 1: new keys distributed, old keys still used to transmit.
    KeyDistribution,
    /// Phase 2: new keys used to transmit, old keys still accepted.
    UsingNewKeys,
}

// ============================================================================
// NETWORK KEY
// ============================================================================

/// Everything derived from a Network Key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct NetworkKeyDerivatives {
    pub nid: u8,
    pub encryption_key: Key128,
    pub privacy_key: Key128,
    pub network_id: [u8; 8],
    pub identity_key: Key128,
    pub beacon_key: Key128,
}

impl NetworkKeyDerivatives {
    pub fn derive(key: &Key128) -> Self {
        let material = crypto::k2(key, &[0x00]);
        Self {
            nid: material.nid,
            encryption_key: material.encryption_key,
            privacy_key: material.privacy_key,
            network_id: crypto::k3(key),
            identity_key: crypto::identity_key(key),
            beacon_key: crypto::beacon_key(key),
        }
    }
}

impl fmt::Debug for NetworkKeyDerivatives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkKeyDerivatives")
            .field("nid", &format_args!("{:#04x}", self.nid))
            .field("network_id", &hex::encode(self.network_id))
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkKeyRecord {
    index: KeyIndex,
    #[serde(default)]
    name: String,
    #[serde(with = "hex_key")]
    key: Key128,
    #[serde(default, with = "hex_key::option", skip_serializing_if = "Option::is_none")]
    old_key: Option<Key128>,
    #[serde(default)]
    phase: KeyRefreshPhase,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "NetworkKeyRecord", into = "NetworkKeyRecord")]
pub struct NetworkKey {
    pub index: KeyIndex,
    pub name: String,
    key: Key128,
    old_key: Option<Key128>,
    phase: KeyRefreshPhase,
    derivatives: NetworkKeyDerivatives,
    old_derivatives: Option<NetworkKeyDerivatives>,
}

impl From<NetworkKeyRecord> for NetworkKey {
    fn from(record: NetworkKeyRecord) -> Self {
        let mut key = NetworkKey::new(record.index, record.key);
        key.name = record.name;
        key.phase = record.phase;
        key.old_derivatives = record.old_key.as_ref().map(NetworkKeyDerivatives::derive);
        key.old_key = record.old_key;
        key
    }
}

impl From<NetworkKey> for NetworkKeyRecord {
    fn from(key: NetworkKey) -> Self {
        NetworkKeyRecord {
            index: key.index,
            name: key.name.clone(),
            key: key.key,
            old_key: key.old_key,
            phase: key.phase,
        }
    }
}

impl NetworkKey {
    pub fn new(index: KeyIndex, key: Key128) -> Self {
        Self {
            index,
            name: format!("Network Key {}", index),
            derivatives: NetworkKeyDerivatives::derive(&key),
            key,
            old_key: None,
            phase: KeyRefreshPhase::NormalOperation,
            old_derivatives: None,
        }
    }

    pub fn key(&self) -> &Key128 {
        &self.key
    }

    pub fn old_key(&self) -> Option<&Key128> {
        self.old_key.as_ref()
    }

    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    pub fn derivatives(&self) -> &NetworkKeyDerivatives {
        &self.derivatives
    }

    pub fn old_derivatives(&self) -> Option<&NetworkKeyDerivatives> {
        self.old_derivatives.as_ref()
    }

    pub fn network_id(&self) -> [u8; 8] {
        self.derivatives.network_id
    }

    /// Material used to encrypt outgoing PDUs in the current phase.
    pub fn transmit_derivatives(&self) -> &NetworkKeyDerivatives {
        match (self.phase, &self.old_derivatives) {
            (KeyRefreshPhase::KeyDistribution, Some(old)) => old,
            _ => &self.derivatives,
        }
    }

    /// Candidate material for a received PDU, current key first.
    pub fn receive_candidates(&self, nid: u8) -> impl Iterator<Item = &NetworkKeyDerivatives> {
        std::iter::once(&self.derivatives)
            .chain(self.old_derivatives.iter())
            .filter(move |d| d.nid == nid)
    }

    /// Phase 1: keep the current key as the old one and install `new_key`.
    pub fn start_key_refresh(&mut self, new_key: Key128) {
        self.old_key = Some(self.key);
        self.old_derivatives = Some(self.derivatives.clone());
        self.derivatives = NetworkKeyDerivatives::derive(&new_key);
        self.key = new_key;
        self.phase = KeyRefreshPhase::KeyDistribution;
    }

    pub fn use_new_keys(&mut self) {
        if self.phase == KeyRefreshPhase::KeyDistribution {
            self.phase = KeyRefreshPhase::UsingNewKeys;
        }
    }

    /// Phase 3: forget the old key.
    pub fn revoke_old_keys(&mut self) {
        if let Some(mut old) = self.old_key.take() {
            old.zeroize();
        }
        self.old_derivatives = None;
        self.phase = KeyRefreshPhase::NormalOperation;
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkKey")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("nid", &format_args!("{:#04x}", self.derivatives.nid))
            .finish_non_exhaustive()
    }
}

impl Drop for NetworkKey {
    fn drop(&mut self) {
        self.key.zeroize();
        if let Some(old) = self.old_key.as_mut() {
            old.zeroize();
        }
    }
}

// ============================================================================
// APPLICATION KEY
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationKeyRecord {
    index: KeyIndex,
    #[serde(default)]
    name: String,
    bound_network_key: KeyIndex,
    #[serde(with = "hex_key")]
    key: Key128,
    #[serde(default, with = "hex_key::option", skip_serializing_if = "Option::is_none")]
    old_key: Option<Key128>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "ApplicationKeyRecord", into = "ApplicationKeyRecord")]
pub struct ApplicationKey {
    pub index: KeyIndex,
    pub name: String,
    pub bound_network_key: KeyIndex,
    key: Key128,
    aid: u8,
    old_key: Option<Key128>,
    old_aid: Option<u8>,
}

impl From<ApplicationKeyRecord> for ApplicationKey {
    fn from(record: ApplicationKeyRecord) -> Self {
        let mut key = ApplicationKey::new(record.index, record.key, record.bound_network_key);
        key.name = record.name;
        key.old_aid = record.old_key.as_ref().map(crypto::k4);
        key.old_key = record.old_key;
        key
    }
}

impl From<ApplicationKey> for ApplicationKeyRecord {
    fn from(key: ApplicationKey) -> Self {
        ApplicationKeyRecord {
            index: key.index,
            name: key.name.clone(),
            bound_network_key: key.bound_network_key,
            key: key.key,
            old_key: key.old_key,
        }
    }
}

impl ApplicationKey {
    pub fn new(index: KeyIndex, key: Key128, bound_network_key: KeyIndex) -> Self {
        Self {
            index,
            name: format!("Application Key {}", index),
            bound_network_key,
            aid: crypto::k4(&key),
            key,
            old_key: None,
            old_aid: None,
        }
    }

    pub fn key(&self) -> &Key128 {
        &self.key
    }

    pub fn aid(&self) -> u8 {
        self.aid
    }

    pub fn old_key(&self) -> Option<&Key128> {
        self.old_key.as_ref()
    }

    pub fn old_aid(&self) -> Option<u8> {
        self.old_aid
    }

    /// Key and AID for transmission, given the phase of the bound network key.
    pub fn transmit_key(&self, phase: KeyRefreshPhase) -> (&Key128, u8) {
        match (phase, &self.old_key, self.old_aid) {
            (KeyRefreshPhase::KeyDistribution, Some(old), Some(aid)) => (old, aid),
            _ => (&self.key, self.aid),
        }
    }

    /// Keys whose AID matches a received PDU, current key first.
    pub fn receive_candidates(&self, aid: u8) -> impl Iterator<Item = &Key128> {
        let current = (self.aid == aid).then_some(&self.key);
        let old = match (&self.old_key, self.old_aid) {
            (Some(key), Some(old_aid)) if old_aid == aid => Some(key),
            _ => None,
        };
        current.into_iter().chain(old)
    }

    pub fn start_key_refresh(&mut self, new_key: Key128) {
        self.old_key = Some(self.key);
        self.old_aid = Some(self.aid);
        self.aid = crypto::k4(&new_key);
        self.key = new_key;
    }

    pub fn revoke_old_key(&mut self) {
        if let Some(mut old) = self.old_key.take() {
            old.zeroize();
        }
        self.old_aid = None;
    }
}

impl fmt::Debug for ApplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationKey")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("bound_network_key", &self.bound_network_key)
            .field("aid", &format_args!("{:#04x}", self.aid))
            .finish_non_exhaustive()
    }
}

impl Drop for ApplicationKey {
    fn drop(&mut self) {
        self.key.zeroize();
        if let Some(old) = self.old_key.as_mut() {
            old.zeroize();
        }
    }
}
