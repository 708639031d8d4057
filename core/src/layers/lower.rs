//! Lower transport layer: replay protection, segmentation and reassembly,
//! Segment Acknowledgments.

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::address::Address;
use crate::config::NetworkParameters;
use crate::effect::{Effects, OutgoingPdu, SendId, TimerKey};
use crate::keys::KeyIndex;
use crate::layers::network::ReceivedPdu;
use crate::mesh::MeshNetwork;
use crate::pdu::{LowerTransportPdu, SegmentAcknowledgment, SegmentKind};
use crate::replay::{seq_auth, ReplayCache, ReplayEntry};
use crate::sar::{
    message_sequence, IncomingSegment, LowerTransportError, OutgoingSegmented, Reassembler,
    SegmentTransmitter,
};

/// Payload handed to the upper transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpperTransportPayload {
    Access {
        aid: Option<u8>,
        /// 64-bit TransMIC (segmented messages only).
        szmic: bool,
        data: Vec<u8>,
    },
    Control {
        opcode: u8,
        parameters: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedUpperTransport {
    pub source: Address,
    pub destination: Address,
    pub ttl: u8,
    /// SEQ used in the upper transport nonce.
    pub sequence: u32,
    pub iv_index: u32,
    pub network_key_index: KeyIndex,
    pub segmented: bool,
    pub payload: UpperTransportPayload,
}

#[derive(Debug)]
pub struct LowerTransportLayer {
    replay: ReplayCache,
    /// Replay entries changed since the last drain, to be saved.
    replay_updates: Vec<(Address, ReplayEntry)>,
    reassembler: Reassembler,
    transmitter: SegmentTransmitter,
}

impl LowerTransportLayer {
    /// Continues replay protection from the state saved in `network`.
    pub fn new(params: &NetworkParameters, network: &MeshNetwork) -> Self {
        Self {
            replay: ReplayCache::restore(params.replay_policy, network.replay_protection.clone()),
            replay_updates: Vec::new(),
            reassembler: Reassembler::new(),
            transmitter: SegmentTransmitter::new(),
        }
    }

    /// Takes the replay entries changed by received PDUs.
    pub fn drain_replay_updates(&mut self) -> Vec<(Address, ReplayEntry)> {
        std::mem::take(&mut self.replay_updates)
    }

    fn accept(&mut self, source: Address, seq_auth: u64, reassembly_in_progress: bool) -> bool {
        if !self.replay.accept(source, seq_auth, reassembly_in_progress) {
            return false;
        }
        if let Some(entry) = self.replay.entry(source) {
            self.replay_updates.push((source, entry));
        }
        true
    }

    /// Whether a segmented message from `source` is still being received.
    pub fn is_receiving_from(&self, source: Address) -> bool {
        self.reassembler.is_receiving_from(source)
    }

    pub fn is_sending_to(&self, destination: Address) -> bool {
        self.transmitter.is_sending_to(destination)
    }

    pub fn receive(
        &mut self,
        received: ReceivedPdu,
        network: &MeshNetwork,
        params: &NetworkParameters,
        now: Instant,
        effects: &mut Effects,
    ) -> Option<ReceivedUpperTransport> {
        let pdu = received.pdu;
        let lower = match LowerTransportPdu::decode(&pdu.transport_pdu, pdu.control) {
            Ok(lower) => lower,
            Err(e) => {
                debug!(source = %pdu.source, error = %e, "Invalid Lower Transport PDU");
                return None;
            }
        };

        match lower {
            LowerTransportPdu::Segment(segment) => {
                let sequence = message_sequence(pdu.sequence, segment.seq_zero);
                let known = self.reassembler.is_in_progress(pdu.source, segment.seq_zero)
                    || self.reassembler.is_completed(pdu.source, segment.seq_zero);
                if !self.accept(pdu.source, seq_auth(pdu.iv_index, sequence), known) {
                    trace!(source = %pdu.source, sequence, "Replayed segment dropped");
                    return None;
                }
                let send_acks = network.is_local_unicast(pdu.destination);
                let message = self.reassembler.handle(
                    IncomingSegment {
                        source: pdu.source,
                        destination: pdu.destination,
                        ttl: pdu.ttl,
                        sequence: pdu.sequence,
                        iv_index: pdu.iv_index,
                        network_key_index: received.network_key_index,
                        segment,
                    },
                    send_acks,
                    params,
                    now,
                    effects,
                )?;
                let payload = match message.kind {
                    SegmentKind::Access { aid, szmic } => UpperTransportPayload::Access {
                        aid,
                        szmic,
                        data: message.data,
                    },
                    SegmentKind::Control { opcode } => UpperTransportPayload::Control {
                        opcode,
                        parameters: message.data,
                    },
                };
                Some(ReceivedUpperTransport {
                    source: message.source,
                    destination: message.destination,
                    ttl: message.ttl,
                    sequence: message.sequence,
                    iv_index: message.iv_index,
                    network_key_index: message.network_key_index,
                    segmented: true,
                    payload,
                })
            }
            unsegmented => {
                if !self.accept(pdu.source, seq_auth(pdu.iv_index, pdu.sequence), false) {
                    trace!(source = %pdu.source, sequence = pdu.sequence, "Replayed PDU dropped");
                    return None;
                }
                let payload = match unsegmented {
                    LowerTransportPdu::Control {
                        opcode: SegmentAcknowledgment::OPCODE,
                        parameters,
                    } => {
                        match SegmentAcknowledgment::from_parameters(&parameters) {
                            Ok(ack) => self.transmitter.on_acknowledgment(
                                pdu.source,
                                pdu.destination,
                                &ack,
                                params,
                                effects,
                            ),
                            Err(e) => debug!(error = %e, "Invalid Segment Acknowledgment"),
                        }
                        return None;
                    }
                    LowerTransportPdu::Control { opcode, parameters } => {
                        UpperTransportPayload::Control { opcode, parameters }
                    }
                    LowerTransportPdu::Access {
                        aid,
                        upper_transport_pdu,
                    } => UpperTransportPayload::Access {
                        aid,
                        szmic: false,
                        data: upper_transport_pdu,
                    },
                    LowerTransportPdu::Segment(_) => return None,
                };
                Some(ReceivedUpperTransport {
                    source: pdu.source,
                    destination: pdu.destination,
                    ttl: pdu.ttl,
                    sequence: pdu.sequence,
                    iv_index: pdu.iv_index,
                    network_key_index: received.network_key_index,
                    segmented: false,
                    payload,
                })
            }
        }
    }

    pub fn send_unsegmented(&mut self, pdu: OutgoingPdu, effects: &mut Effects) {
        effects.transmit(pdu);
    }

    pub fn send_segmented(&mut self, message: OutgoingSegmented, params: &NetworkParameters, effects: &mut Effects) {
        self.transmitter.start(message, params, effects);
    }

    pub fn cancel(&mut self, id: SendId, effects: &mut Effects) -> bool {
        self.transmitter.cancel(id, effects)
    }

    /// Fails every outgoing transfer, e.g. when the bearer closed.
    pub fn abort_all(&mut self, error: LowerTransportError, effects: &mut Effects) {
        self.transmitter.abort_all(error, effects);
    }

    /// Routes a fired SAR timer. Returns false for timers owned by other layers.
    pub fn on_timer(&mut self, timer: TimerKey, params: &NetworkParameters, effects: &mut Effects) -> bool {
        match timer {
            TimerKey::ReassemblyDiscard(key) => self.reassembler.on_discard_timer(key, effects),
            TimerKey::ReassemblyAck(key) => self.reassembler.on_ack_timer(key, params, effects),
            TimerKey::AckRetransmission(key) => {
                self.reassembler.on_ack_retransmission(key, params, effects)
            }
            TimerKey::SegmentPacing(key) => self.transmitter.on_pacing_timer(key, params, effects),
            TimerKey::UnicastRetransmission(key) => {
                self.transmitter.on_unicast_timer(key, params, effects)
            }
            TimerKey::MulticastRetransmission(key) => {
                self.transmitter.on_multicast_timer(key, params, effects)
            }
            _ => return false,
        }
        true
    }
}
