//! Network layer: network encryption, duplicate filtering, sequence numbers,
//! relay, proxy configuration PDUs and Secure Network beacons.

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::config::NetworkParameters;
use crate::effect::OutgoingPdu;
use crate::keys::{IvIndex, KeyIndex, KeyRefreshPhase};
use crate::layers::AccessError;
use crate::mesh::MeshNetwork;
use crate::pdu::{
    LowerTransportPdu, NetworkPdu, NonceType, ProxyConfigurationMessage, SecureNetworkBeacon,
};
use crate::MeshError;

/// Raw PDUs remembered for duplicate detection.
const DUPLICATE_CACHE_SIZE: usize = 256;
/// Sequence numbers reserved (and persisted) ahead of use.
pub const SEQUENCE_LOOKAHEAD: u32 = 64;
pub const MAX_SEQUENCE: u32 = 0x00FF_FFFF;
/// Source of proxy configuration messages from a node without an address.
const PROXY_CONFIGURATION_FALLBACK_SOURCE: Address = Address(0x7FFF);
/// Largest IV Index jump accepted from a beacon without recovery enabled.
const MAX_IV_INDEX_JUMP: u32 = 42;

/// A decrypted Network PDU and the key that opened it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPdu {
    pub pdu: NetworkPdu,
    pub network_key_index: KeyIndex,
}

/// An encrypted PDU ready for the bearer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPdu {
    pub data: Vec<u8>,
    pub sequence: u32,
    /// The sequence reservation moved and the configuration must be saved.
    pub persist: bool,
}

/// Configuration changes caused by a Secure Network beacon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeaconChanges {
    /// Network key the beacon was authenticated with.
    pub network_key_index: Option<KeyIndex>,
    pub iv_index: Option<IvIndex>,
    pub key_refresh: Option<(KeyIndex, KeyRefreshPhase)>,
}

impl BeaconChanges {
    /// Whether the network configuration changed and must be saved.
    pub fn is_changed(&self) -> bool {
        self.iv_index.is_some() || self.key_refresh.is_some()
    }
}

#[derive(Debug, Default)]
pub struct NetworkLayer {
    seen: HashSet<Vec<u8>>,
    seen_order: VecDeque<Vec<u8>>,
    next_sequence: HashMap<Address, u32>,
    /// Network key of the connected GATT proxy, learnt from its first message.
    proxy_network_key: Option<KeyIndex>,
}

impl NetworkLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proxy_network_key(&self) -> Option<KeyIndex> {
        self.proxy_network_key
    }

    pub fn set_proxy_network_key(&mut self, index: Option<KeyIndex>) {
        self.proxy_network_key = index;
    }

    fn is_duplicate(&mut self, raw: &[u8]) -> bool {
        if self.seen.contains(raw) {
            return true;
        }
        if self.seen_order.len() >= DUPLICATE_CACHE_SIZE {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(raw.to_vec());
        self.seen_order.push_back(raw.to_vec());
        false
    }

    fn decrypt(&self, raw: &[u8], nonce: NonceType, network: &MeshNetwork) -> Option<ReceivedPdu> {
        let (_, nid) = NetworkPdu::peek_ivi_nid(raw)?;
        for key in &network.network_keys {
            for candidate in key.receive_candidates(nid) {
                match NetworkPdu::decode(raw, candidate, &network.iv_index, nonce) {
                    Ok(pdu) => {
                        return Some(ReceivedPdu {
                            pdu,
                            network_key_index: key.index,
                        })
                    }
                    Err(e) => trace!(key = key.index, error = %e, "Network key candidate rejected"),
                }
            }
        }
        None
    }

    /// Decrypts a Network PDU from the bearer. Duplicates, undecryptable
    /// PDUs and echoes of this node's own PDUs yield `None`.
    pub fn receive(&mut self, raw: &[u8], network: &MeshNetwork) -> Option<ReceivedPdu> {
        if self.is_duplicate(raw) {
            trace!("Duplicate Network PDU dropped");
            return None;
        }
        let received = match self.decrypt(raw, NonceType::Network, network) {
            Some(received) => received,
            None => {
                debug!(len = raw.len(), "Network PDU could not be decrypted");
                return None;
            }
        };
        if network.is_local_unicast(received.pdu.source) {
            trace!(source = %received.pdu.source, "Own Network PDU dropped");
            return None;
        }
        Some(received)
    }

    /// Decrypts a proxy configuration message.
    pub fn receive_proxy_configuration(
        &mut self,
        raw: &[u8],
        network: &MeshNetwork,
    ) -> Option<(ProxyConfigurationMessage, KeyIndex)> {
        let received = self.decrypt(raw, NonceType::Proxy, network)?;
        if !received.pdu.control || !received.pdu.destination.is_unassigned() {
            debug!("Malformed proxy configuration PDU");
            return None;
        }
        match ProxyConfigurationMessage::decode(&received.pdu.transport_pdu) {
            Ok(message) => Some((message, received.network_key_index)),
            Err(e) => {
                debug!(error = %e, "Invalid proxy configuration message");
                None
            }
        }
    }

    /// Whether `received` should be relayed by this node.
    pub fn should_relay(&self, received: &ReceivedPdu, network: &MeshNetwork) -> bool {
        let relay_enabled = network
            .local_node()
            .map(|n| n.features.relay)
            .unwrap_or(false);
        relay_enabled
            && received.pdu.ttl >= 2
            && !network.is_local_unicast(received.pdu.destination)
    }

    /// Re-encrypts a received PDU with TTL − 1, keeping SEQ and SRC.
    pub fn relay(&mut self, received: &ReceivedPdu, network: &MeshNetwork) -> Option<Vec<u8>> {
        let key = network.network_key(received.network_key_index)?;
        let mut pdu = received.pdu.clone();
        pdu.ttl -= 1;
        match pdu.encode(key.transmit_derivatives(), NonceType::Network) {
            Ok(data) => {
                // Our own relayed copy must not come back in.
                self.is_duplicate(&data);
                Some(data)
            }
            Err(e) => {
                warn!(error = %e, "Relay encoding failed");
                None
            }
        }
    }

    /// Allocates the next SEQ for `source`. The returned flag is set when the
    /// persisted reservation moved forward.
    pub fn next_sequence(&mut self, source: Address, network: &mut MeshNetwork) -> Option<(u32, bool)> {
        let reserved = network.sequence_numbers.get(&source).copied().unwrap_or(0);
        let next = self.next_sequence.entry(source).or_insert(reserved);
        let sequence = *next;
        if sequence > MAX_SEQUENCE {
            return None;
        }
        *next += 1;
        let mut persist = false;
        if *next > reserved {
            network
                .sequence_numbers
                .insert(source, (sequence + SEQUENCE_LOOKAHEAD).min(MAX_SEQUENCE + 1));
            persist = true;
        }
        Some((sequence, persist))
    }

    /// Sequence numbers restart after the IV Index moved forward.
    pub fn reset_sequences(&mut self, network: &mut MeshNetwork) {
        self.next_sequence.clear();
        network.sequence_numbers.clear();
    }

    /// Encrypts a Lower Transport PDU into a Network PDU.
    pub fn encrypt(&mut self, outgoing: &OutgoingPdu, network: &mut MeshNetwork) -> Result<EncodedPdu, MeshError> {
        let (sequence, persist) = match outgoing.sequence {
            Some(sequence) => (sequence, false),
            None => self
                .next_sequence(outgoing.source, network)
                .ok_or(AccessError::SequenceExhausted(outgoing.source))?,
        };
        let key = network
            .network_key(outgoing.network_key_index)
            .ok_or(AccessError::KeyNotFound(outgoing.network_key_index))?;
        let pdu = NetworkPdu {
            iv_index: network.iv_index.transmit_index(),
            nid: key.transmit_derivatives().nid,
            control: outgoing.lower.is_control(),
            ttl: outgoing.ttl,
            sequence,
            source: outgoing.source,
            destination: outgoing.destination,
            transport_pdu: outgoing.lower.encode(),
        };
        let data = pdu.encode(key.transmit_derivatives(), NonceType::Network)?;
        self.is_duplicate(&data);
        trace!(
            source = %outgoing.source,
            destination = %outgoing.destination,
            sequence,
            "Network PDU encrypted"
        );
        Ok(EncodedPdu {
            data,
            sequence,
            persist,
        })
    }

    /// Encrypts a proxy configuration message for the connected proxy.
    pub fn encrypt_proxy_configuration(
        &mut self,
        message: &ProxyConfigurationMessage,
        network: &mut MeshNetwork,
    ) -> Result<EncodedPdu, MeshError> {
        let index = self
            .proxy_network_key
            .ok_or(crate::bearer::BearerError::Closed)?;
        let source = network
            .local_node()
            .map(|n| n.unicast_address)
            .unwrap_or(PROXY_CONFIGURATION_FALLBACK_SOURCE);
        let (sequence, persist) = self
            .next_sequence(source, network)
            .ok_or(AccessError::SequenceExhausted(source))?;
        let key = network
            .network_key(index)
            .ok_or(AccessError::KeyNotFound(index))?;
        let encoded = message.encode();
        let lower = LowerTransportPdu::Control {
            opcode: encoded[0],
            parameters: encoded[1..].to_vec(),
        };
        let pdu = NetworkPdu {
            iv_index: network.iv_index.transmit_index(),
            nid: key.transmit_derivatives().nid,
            control: true,
            ttl: 0,
            sequence,
            source,
            destination: Address::UNASSIGNED,
            transport_pdu: lower.encode(),
        };
        let data = pdu.encode(key.transmit_derivatives(), NonceType::Proxy)?;
        Ok(EncodedPdu {
            data,
            sequence,
            persist,
        })
    }

    /// Authenticates a Secure Network beacon and applies its IV Index and Key
    /// Refresh flags.
    pub fn handle_beacon(
        &mut self,
        raw: &[u8],
        network: &mut MeshNetwork,
        params: &NetworkParameters,
    ) -> BeaconChanges {
        let mut changes = BeaconChanges::default();
        let (beacon, auth) = match SecureNetworkBeacon::decode(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "Beacon ignored");
                return changes;
            }
        };
        let matching = network.network_keys.iter_mut().find(|key| {
            let current = key.network_id() == beacon.network_id
                && beacon.authenticate(&auth, &key.derivatives().beacon_key);
            let old = key.old_derivatives().is_some_and(|old| {
                old.network_id == beacon.network_id && beacon.authenticate(&auth, &old.beacon_key)
            });
            current || old
        });
        let Some(key) = matching else {
            debug!("Beacon from unknown network or with invalid authentication");
            return changes;
        };
        changes.network_key_index = Some(key.index);

        let key_index = key.index;
        let phase_before = key.phase();
        let on_new_key = key.network_id() == beacon.network_id;
        match (phase_before, beacon.key_refresh) {
            (KeyRefreshPhase::KeyDistribution, true) if on_new_key => key.use_new_keys(),
            (KeyRefreshPhase::UsingNewKeys, false) if on_new_key => key.revoke_old_keys(),
            _ => {}
        }
        let phase_after = key.phase();
        if phase_after != phase_before {
            if phase_after == KeyRefreshPhase::NormalOperation {
                network
                    .application_keys
                    .iter_mut()
                    .filter(|k| k.bound_network_key == key_index)
                    .for_each(|k| k.revoke_old_key());
            }
            info!(key = key_index, phase = ?phase_after, "Key refresh phase changed");
            changes.key_refresh = Some((key_index, phase_after));
        }

        let current = network.iv_index;
        let accepted = if beacon.iv_index > current.index {
            let jump = beacon.iv_index - current.index;
            jump <= MAX_IV_INDEX_JUMP
                || params.allow_iv_index_recovery_over_42
                || params.iv_update_test_mode
        } else {
            beacon.iv_index == current.index && current.update_active && !beacon.iv_update_active
        };
        if accepted {
            let updated = IvIndex::new(beacon.iv_index, beacon.iv_update_active);
            if updated.transmit_index() != current.transmit_index() {
                self.reset_sequences(network);
            }
            network.iv_index = updated;
            info!(iv_index = %updated, "IV Index updated");
            changes.iv_index = Some(updated);
        } else if beacon.iv_index > current.index {
            warn!(
                current = current.index,
                received = beacon.iv_index,
                "IV Index jump too large; beacon ignored"
            );
        }
        changes
    }

    /// Secure Network beacon for `index` reflecting the current state.
    pub fn beacon(&self, index: KeyIndex, network: &MeshNetwork) -> Option<Vec<u8>> {
        let key = network.network_key(index)?;
        let beacon = SecureNetworkBeacon {
            key_refresh: key.phase() == KeyRefreshPhase::UsingNewKeys,
            iv_update_active: network.iv_index.update_active,
            network_id: key.network_id(),
            iv_index: network.iv_index.index,
        };
        Some(beacon.encode(&key.derivatives().beacon_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NetworkKey;
    use crate::mesh::{Element, Features, Model, ModelId, Node};

    fn key(s: &str) -> [u8; 16] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    fn network(local: u16) -> MeshNetwork {
        let mut network = MeshNetwork::new("test");
        network
            .network_keys
            .push(NetworkKey::new(0, key("7dd7364cd842ad18c17c2b820c84c3d6")));
        network.iv_index = IvIndex::new(0x1234_5678, false);
        let mut node = Node::new(
            "local",
            Address(local),
            vec![Element::new(vec![Model::new(ModelId::GENERIC_ON_OFF_SERVER)])],
        );
        node.network_keys.push(0);
        network.local_node = Some(node);
        network
    }

    fn outgoing(source: u16, destination: u16) -> OutgoingPdu {
        OutgoingPdu {
            source: Address(source),
            destination: Address(destination),
            ttl: 4,
            network_key_index: 0,
            lower: LowerTransportPdu::Access {
                aid: Some(0x26),
                upper_transport_pdu: vec![0x11; 9],
            },
            sequence: None,
            send_id: None,
        }
    }

    #[test]
    fn test_sequence_reservation_persists_in_blocks() {
        let mut network = network(0x0003);
        let mut layer = NetworkLayer::new();
        let source = Address(0x0003);

        let (first, persist) = layer.next_sequence(source, &mut network).unwrap();
        assert_eq!(first, 0);
        assert!(persist);
        assert_eq!(network.sequence_numbers[&source], SEQUENCE_LOOKAHEAD);

        for expected in 1..SEQUENCE_LOOKAHEAD {
            let (seq, persist) = layer.next_sequence(source, &mut network).unwrap();
            assert_eq!(seq, expected);
            assert!(!persist);
        }
        let (seq, persist) = layer.next_sequence(source, &mut network).unwrap();
        assert_eq!(seq, SEQUENCE_LOOKAHEAD);
        assert!(persist);

        // A restarted layer continues from the reservation.
        let mut restarted = NetworkLayer::new();
        let (seq, _) = restarted.next_sequence(source, &mut network).unwrap();
        assert_eq!(seq, 2 * SEQUENCE_LOOKAHEAD);
    }

    #[test]
    fn test_round_trip_between_nodes() {
        let mut sender = network(0x0003);
        let receiver_network = network(0x1201);
        let mut tx = NetworkLayer::new();
        let mut rx = NetworkLayer::new();

        let encoded = tx.encrypt(&outgoing(0x0003, 0x1201), &mut sender).unwrap();
        let received = rx.receive(&encoded.data, &receiver_network).unwrap();
        assert_eq!(received.pdu.source, Address(0x0003));
        assert_eq!(received.pdu.destination, Address(0x1201));
        assert_eq!(received.pdu.ttl, 4);

        assert!(rx.receive(&encoded.data, &receiver_network).is_none());
    }

    #[test]
    fn test_own_pdus_are_dropped() {
        let mut sender = network(0x0003);
        let mut tx = NetworkLayer::new();
        let encoded = tx.encrypt(&outgoing(0x0003, 0xC000), &mut sender).unwrap();
        let mut other = NetworkLayer::new();
        assert!(other.receive(&encoded.data, &sender).is_none());
    }

    #[test]
    fn test_relay_decrements_ttl() {
        let mut sender = network(0x0003);
        let mut relay_network = network(0x0100);
        if let Some(node) = relay_network.local_node.as_mut() {
            node.features = Features {
                relay: true,
                proxy: false,
            };
        }
        let mut tx = NetworkLayer::new();
        let mut relay = NetworkLayer::new();
        let encoded = tx.encrypt(&outgoing(0x0003, 0x1201), &mut sender).unwrap();
        let received = relay.receive(&encoded.data, &relay_network).unwrap();
        assert!(relay.should_relay(&received, &relay_network));

        let relayed = relay.relay(&received, &relay_network).unwrap();
        let mut rx = NetworkLayer::new();
        let again = rx.receive(&relayed, &network(0x1201)).unwrap();
        assert_eq!(again.pdu.ttl, 3);
        assert_eq!(again.pdu.sequence, received.pdu.sequence);
    }

    #[test]
    fn test_proxy_configuration_requires_proxy_key() {
        let mut network = network(0x0003);
        let mut layer = NetworkLayer::new();
        let message = ProxyConfigurationMessage::SetFilterType(crate::pdu::ProxyFilterType::RejectList);
        assert!(matches!(
            layer.encrypt_proxy_configuration(&message, &mut network),
            Err(MeshError::Bearer(crate::bearer::BearerError::Closed))
        ));

        layer.set_proxy_network_key(Some(0));
        let encoded = layer.encrypt_proxy_configuration(&message, &mut network).unwrap();
        let mut rx = NetworkLayer::new();
        let (decoded, index) = rx
            .receive_proxy_configuration(&encoded.data, &self::network(0x0100))
            .unwrap();
        assert_eq!(decoded, message);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_beacon_moves_iv_index_and_resets_sequences() {
        let mut network = network(0x0003);
        let mut layer = NetworkLayer::new();
        layer.next_sequence(Address(0x0003), &mut network);

        let net_key = network.network_key(0).unwrap();
        let beacon = SecureNetworkBeacon {
            key_refresh: false,
            iv_update_active: true,
            network_id: net_key.network_id(),
            iv_index: 0x1234_5679,
        }
        .encode(&net_key.derivatives().beacon_key);

        let changes = layer.handle_beacon(&beacon, &mut network, &NetworkParameters::default());
        assert_eq!(changes.iv_index, Some(IvIndex::new(0x1234_5679, true)));
        // Transmit index is unchanged while the update is in progress.
        assert_eq!(network.iv_index.transmit_index(), 0x1234_5678);
        assert!(!network.sequence_numbers.is_empty());

        let net_key = network.network_key(0).unwrap();
        let normal = SecureNetworkBeacon {
            key_refresh: false,
            iv_update_active: false,
            network_id: net_key.network_id(),
            iv_index: 0x1234_5679,
        }
        .encode(&net_key.derivatives().beacon_key);
        let changes = layer.handle_beacon(&normal, &mut network, &NetworkParameters::default());
        assert_eq!(changes.iv_index, Some(IvIndex::new(0x1234_5679, false)));
        assert!(changes.is_changed());
        assert!(network.sequence_numbers.is_empty());
    }

    #[test]
    fn test_beacon_with_large_jump_is_ignored() {
        let mut network = network(0x0003);
        let mut layer = NetworkLayer::new();
        let net_key = network.network_key(0).unwrap();
        let beacon = SecureNetworkBeacon {
            key_refresh: false,
            iv_update_active: false,
            network_id: net_key.network_id(),
            iv_index: 0x1234_5678 + 43,
        }
        .encode(&net_key.derivatives().beacon_key);
        let changes = layer.handle_beacon(&beacon, &mut network, &NetworkParameters::default());
        assert_eq!(changes.network_key_index, Some(0));
        assert!(!changes.is_changed());
    }

    #[test]
    fn test_beacon_drives_key_refresh() {
        let mut network = network(0x0003);
        let mut layer = NetworkLayer::new();
        network
            .network_key_mut(0)
            .unwrap()
            .start_key_refresh(key("f7a2a44f8e8a8029064f173ddc1e2b00"));
        let beacon = |network: &MeshNetwork, kr: bool| {
            let net_key = network.network_key(0).unwrap();
            SecureNetworkBeacon {
                key_refresh: kr,
                iv_update_active: false,
                network_id: net_key.network_id(),
                iv_index: 0x1234_5678,
            }
            .encode(&net_key.derivatives().beacon_key)
        };
        let params = NetworkParameters::default();

        let kr = beacon(&network, true);
        let changes = layer.handle_beacon(&kr, &mut network, &params);
        assert_eq!(changes.key_refresh, Some((0, KeyRefreshPhase::UsingNewKeys)));

        let normal = beacon(&network, false);
        let changes = layer.handle_beacon(&normal, &mut network, &params);
        assert_eq!(changes.key_refresh, Some((0, KeyRefreshPhase::NormalOperation)));
        assert!(network.network_key(0).unwrap().old_key().is_none());
    }
}
