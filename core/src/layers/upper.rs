//! Upper transport layer: access message encryption and decryption, and the
//! per-destination queue of segmented messages.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

use crate::address::{Address, MeshAddress};
use crate::config::NetworkParameters;
use crate::crypto::Key128;
use crate::effect::{Effects, OutgoingPdu, SendId};
use crate::keys::KeyIndex;
use crate::layers::lower::{LowerTransportLayer, ReceivedUpperTransport};
use crate::layers::network::NetworkLayer;
use crate::layers::AccessError;
use crate::mesh::MeshNetwork;
use crate::pdu::lower::MAX_UNSEGMENTED_CONTROL_SIZE;
use crate::pdu::upper::{self, KeyKind, UpperTransportHeader, MAX_UNSEGMENTED_ACCESS_PAYLOAD};
use crate::pdu::{AccessPdu, LowerTransportPdu, SegmentKind};
use crate::sar::OutgoingSegmented;
use crate::MeshError;

/// Security level of an access message. High security uses a 64-bit
/// TransMIC when the message is segmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    Low,
    High,
}

/// Key an access message is (or was) encrypted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKey {
    Application(KeyIndex),
    Device,
}

#[derive(Debug, Clone)]
pub enum KeySelection {
    Application(KeyIndex),
    Device {
        key: Key128,
        network_key_index: KeyIndex,
    },
}

/// An access message ready for encryption.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub id: SendId,
    pub source: Address,
    pub destination: MeshAddress,
    pub ttl: u8,
    pub key: KeySelection,
    pub pdu: AccessPdu,
    pub security: Security,
    pub force_segmented: bool,
}

impl AccessRequest {
    pub fn is_segmented(&self) -> bool {
        self.force_segmented || self.pdu.len() > MAX_UNSEGMENTED_ACCESS_PAYLOAD
    }

    /// Number of Lower Transport PDUs the message needs.
    pub fn segment_count(&self) -> usize {
        if !self.is_segmented() {
            return 1;
        }
        let mic = if self.security == Security::High { 8 } else { 4 };
        (self.pdu.len() + mic).div_ceil(12)
    }
}

/// What happened to an access message handed to the upper transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent as one unsegmented PDU.
    Sent,
    /// Segmented transfer started; completion is reported by the lower layer.
    Segmented,
    /// Waiting for an earlier segmented message to the same destination.
    Queued,
}

/// A decrypted access message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAccess {
    pub source: Address,
    pub destination: MeshAddress,
    pub ttl: u8,
    pub network_key_index: KeyIndex,
    pub key: AccessKey,
    pub pdu: AccessPdu,
    pub segmented: bool,
}

#[derive(Debug, Default)]
pub struct UpperTransportLayer {
    queues: HashMap<Address, VecDeque<AccessRequest>>,
}

impl UpperTransportLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self, destination: Address) -> usize {
        self.queues.get(&destination).map(VecDeque::len).unwrap_or(0)
    }

    /// Encrypts and sends `request`, or queues it behind a segmented message
    /// already in flight to the same destination. Returns whether the
    /// configuration must be saved (sequence reservation moved).
    pub fn send(
        &mut self,
        request: AccessRequest,
        network: &mut MeshNetwork,
        network_layer: &mut NetworkLayer,
        lower: &mut LowerTransportLayer,
        params: &NetworkParameters,
        effects: &mut Effects,
    ) -> Result<(SendOutcome, bool), MeshError> {
        let destination = request.destination.address;
        if request.is_segmented()
            && (lower.is_sending_to(destination) || self.queued(destination) > 0)
        {
            trace!(id = request.id, destination = %destination, "Segmented message queued");
            self.queues.entry(destination).or_default().push_back(request);
            return Ok((SendOutcome::Queued, false));
        }
        self.encrypt_and_send(request, network, network_layer, lower, params, effects)
    }

    fn encrypt_and_send(
        &mut self,
        request: AccessRequest,
        network: &mut MeshNetwork,
        network_layer: &mut NetworkLayer,
        lower: &mut LowerTransportLayer,
        params: &NetworkParameters,
        effects: &mut Effects,
    ) -> Result<(SendOutcome, bool), MeshError> {
        let (key, aid, network_key_index, kind) = match &request.key {
            KeySelection::Application(index) => {
                let app_key = network
                    .application_key(*index)
                    .ok_or(AccessError::KeyNotFound(*index))?;
                let net_key = network
                    .network_key(app_key.bound_network_key)
                    .ok_or(AccessError::KeyNotFound(app_key.bound_network_key))?;
                let (key, aid) = app_key.transmit_key(net_key.phase());
                (*key, Some(aid), app_key.bound_network_key, KeyKind::Application)
            }
            KeySelection::Device {
                key,
                network_key_index,
            } => (*key, None, *network_key_index, KeyKind::Device),
        };

        let segmented = request.is_segmented();
        let (sequence, persist) = network_layer
            .next_sequence(request.source, network)
            .ok_or(AccessError::SequenceExhausted(request.source))?;
        let szmic = segmented && request.security == Security::High;
        let header = UpperTransportHeader {
            kind,
            aszmic: szmic,
            sequence,
            source: request.source,
            destination: request.destination.address,
            iv_index: network.iv_index.transmit_index(),
        };
        let label = request.destination.label_bytes();
        let data = upper::encrypt(&header, &key, &request.pdu.encode(), label.as_ref())?;

        if segmented {
            lower.send_segmented(
                OutgoingSegmented {
                    id: request.id,
                    source: request.source,
                    destination: request.destination.address,
                    ttl: request.ttl,
                    network_key_index,
                    kind: SegmentKind::Access { aid, szmic },
                    sequence,
                    data,
                },
                params,
                effects,
            );
            return Ok((SendOutcome::Segmented, persist));
        }
        lower.send_unsegmented(
            OutgoingPdu {
                source: request.source,
                destination: request.destination.address,
                ttl: request.ttl,
                network_key_index,
                lower: LowerTransportPdu::Access {
                    aid,
                    upper_transport_pdu: data,
                },
                sequence: Some(sequence),
                send_id: Some(request.id),
            },
            effects,
        );
        Ok((SendOutcome::Sent, persist))
    }

    /// Starts the next queued segmented message to `destination`.
    #[allow(clippy::too_many_arguments)]
    pub fn on_segmented_completed(
        &mut self,
        destination: Address,
        network: &mut MeshNetwork,
        network_layer: &mut NetworkLayer,
        lower: &mut LowerTransportLayer,
        params: &NetworkParameters,
        effects: &mut Effects,
    ) -> Vec<(SendId, Result<(SendOutcome, bool), MeshError>)> {
        let mut results = Vec::new();
        while let Some(request) = self.queues.get_mut(&destination).and_then(VecDeque::pop_front) {
            let id = request.id;
            let result = self.encrypt_and_send(request, network, network_layer, lower, params, effects);
            let started = matches!(result, Ok((SendOutcome::Segmented, _)));
            results.push((id, result));
            if started {
                break;
            }
        }
        if self.queues.get(&destination).is_some_and(VecDeque::is_empty) {
            self.queues.remove(&destination);
        }
        results
    }

    /// Removes a queued message. Returns whether it was queued.
    pub fn cancel(&mut self, id: SendId) -> bool {
        for queue in self.queues.values_mut() {
            if let Some(position) = queue.iter().position(|r| r.id == id) {
                queue.remove(position);
                return true;
            }
        }
        false
    }

    /// Drains every queued message, e.g. when the bearer closed.
    pub fn drain_queued(&mut self) -> Vec<SendId> {
        self.queues
            .drain()
            .flat_map(|(_, queue)| queue.into_iter().map(|r| r.id))
            .collect()
    }

    /// Sends a control message; segmented when its parameters do not fit one PDU.
    #[allow(clippy::too_many_arguments)]
    pub fn send_control(
        &mut self,
        opcode: u8,
        parameters: Vec<u8>,
        source: Address,
        destination: Address,
        ttl: u8,
        network_key_index: KeyIndex,
        network: &mut MeshNetwork,
        network_layer: &mut NetworkLayer,
        lower: &mut LowerTransportLayer,
        params: &NetworkParameters,
        effects: &mut Effects,
    ) -> Result<bool, MeshError> {
        if parameters.len() <= MAX_UNSEGMENTED_CONTROL_SIZE {
            lower.send_unsegmented(
                OutgoingPdu {
                    source,
                    destination,
                    ttl,
                    network_key_index,
                    lower: LowerTransportPdu::Control { opcode, parameters },
                    sequence: None,
                    send_id: None,
                },
                effects,
            );
            return Ok(false);
        }
        let (sequence, persist) = network_layer
            .next_sequence(source, network)
            .ok_or(AccessError::SequenceExhausted(source))?;
        lower.send_segmented(
            OutgoingSegmented {
                id: 0,
                source,
                destination,
                ttl,
                network_key_index,
                kind: SegmentKind::Control { opcode },
                sequence,
                data: parameters,
            },
            params,
            effects,
        );
        Ok(persist)
    }

    /// Decrypts an access payload, trying every candidate key and label.
    pub fn decrypt(
        &self,
        received: &ReceivedUpperTransport,
        aid: Option<u8>,
        szmic: bool,
        data: &[u8],
        network: &MeshNetwork,
    ) -> Option<ReceivedAccess> {
        let labels: Vec<Option<MeshAddress>> = if received.destination.is_virtual() {
            network
                .virtual_labels(received.destination)
                .into_iter()
                .map(|label| Some(MeshAddress::from_label(label)))
                .collect()
        } else {
            vec![None]
        };
        let header = |kind| UpperTransportHeader {
            kind,
            aszmic: szmic,
            sequence: received.sequence,
            source: received.source,
            destination: received.destination,
            iv_index: received.iv_index,
        };

        let candidates: Vec<(AccessKey, &Key128)> = match aid {
            Some(aid) => network
                .application_keys
                .iter()
                .filter(|k| k.bound_network_key == received.network_key_index)
                .flat_map(|k| {
                    k.receive_candidates(aid)
                        .map(move |key| (AccessKey::Application(k.index), key))
                })
                .collect(),
            None => [received.source, received.destination]
                .into_iter()
                .filter_map(|address| network.node_with_address(address))
                .filter_map(|node| node.device_key.as_ref())
                .map(|key| (AccessKey::Device, key))
                .collect(),
        };
        let kind = if aid.is_some() {
            KeyKind::Application
        } else {
            KeyKind::Device
        };

        for (access_key, key) in candidates {
            for label in &labels {
                let label_bytes = label.and_then(|l| l.label_bytes());
                let Ok(plaintext) = upper::decrypt(&header(kind), key, data, label_bytes.as_ref()) else {
                    continue;
                };
                let pdu = match AccessPdu::decode(&plaintext) {
                    Ok(pdu) => pdu,
                    Err(e) => {
                        debug!(source = %received.source, error = %e, "Invalid Access PDU");
                        return None;
                    }
                };
                return Some(ReceivedAccess {
                    source: received.source,
                    destination: label.unwrap_or_else(|| MeshAddress::new(received.destination)),
                    ttl: received.ttl,
                    network_key_index: received.network_key_index,
                    key: access_key,
                    pdu,
                    segmented: received.segmented,
                });
            }
        }
        debug!(source = %received.source, "No key could decrypt the Upper Transport PDU");
        None
    }
}
