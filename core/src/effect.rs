//! Side effects produced by the layer state machines.
//!
//! Layers never touch the bearer, the clock or the delegate directly. They
//! mutate their own state and describe what should happen next; the engine
//! drains the list after every step.

use std::time::Duration;

use crate::address::Address;
use crate::keys::KeyIndex;
use crate::mesh::ModelId;
use crate::pdu::LowerTransportPdu;

/// Identifies one outgoing message from the access layer down to the SAR
/// transmitter.
pub type SendId = u64;

/// Reassembly and outgoing segmentation contexts are keyed by the address on
/// the remote side of the transfer and SeqZero.
pub fn sar_key(address: Address, seq_zero: u16) -> u32 {
    (u32::from(address.0) << 16) | u32::from(seq_zero & 0x1FFF)
}

/// A Lower Transport PDU ready for the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPdu {
    pub source: Address,
    pub destination: Address,
    pub ttl: u8,
    pub network_key_index: KeyIndex,
    pub lower: LowerTransportPdu,
    /// Sequence number reserved by the upper transport layer; a fresh one is
    /// allocated when `None`.
    pub sequence: Option<u32>,
    /// Send this PDU belongs to, for bearer error reporting.
    pub send_id: Option<SendId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Incomplete timer of a reassembly context.
    ReassemblyDiscard(u32),
    /// Acknowledgment timer of a reassembly context.
    ReassemblyAck(u32),
    /// Repeated acknowledgment for a message with many segments.
    AckRetransmission(u32),
    /// Spacing between consecutive outgoing segments.
    SegmentPacing(u32),
    UnicastRetransmission(u32),
    MulticastRetransmission(u32),
    /// Resend of an acknowledged message still waiting for its response.
    AcknowledgedRetry(SendId),
    AcknowledgedTimeout(SendId),
    /// Randomly delayed response to a request.
    DelayedReply(u64),
    PublicationRetransmit { element: Address, model: ModelId },
    PeriodicPublication { element: Address, model: ModelId },
    /// Timeout of a `wait_for` call.
    WaitTimeout(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Transmit(OutgoingPdu),
    Schedule { timer: TimerKey, after: Duration },
    Cancel(TimerKey),
    /// The lower transport layer finished with a segmented message.
    SegmentedCompleted {
        id: SendId,
        source: Address,
        destination: Address,
        result: Result<(), crate::sar::LowerTransportError>,
    },
}

/// Ordered effect buffer.
#[derive(Debug, Default)]
pub struct Effects {
    items: Vec<Effect>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: Effect) {
        self.items.push(effect);
    }

    pub fn transmit(&mut self, pdu: OutgoingPdu) {
        self.items.push(Effect::Transmit(pdu));
    }

    pub fn schedule(&mut self, timer: TimerKey, after: Duration) {
        self.items.push(Effect::Schedule { timer, after });
    }

    pub fn cancel(&mut self, timer: TimerKey) {
        self.items.push(Effect::Cancel(timer));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Effect> {
        self.items.drain(..)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Effect> {
        self.items.iter()
    }
}
