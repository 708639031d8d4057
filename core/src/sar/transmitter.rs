// Outgoing segmented message transmission.
//
// A transfer goes through passes. A pass sends every segment that is not yet
// acknowledged, one per segment interval. When a pass ends the transmitter
// waits for the retransmission timer (unicast) or the multicast interval.
// Unicast transfers end on a complete BlockAck, a busy ack (BlockAck 0) or when
// the last permitted retransmission pass has been sent.

use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::LowerTransportError;
use crate::address::Address;
use crate::config::NetworkParameters;
use crate::effect::{sar_key, Effect, Effects, OutgoingPdu, SendId, TimerKey};
use crate::keys::KeyIndex;
use crate::pdu::{LowerTransportPdu, Segment, SegmentAcknowledgment, SegmentKind};

/// An Upper Transport PDU that must be sent segmented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSegmented {
    pub id: SendId,
    pub source: Address,
    pub destination: Address,
    pub ttl: u8,
    pub network_key_index: KeyIndex,
    pub kind: SegmentKind,
    /// SEQ the upper transport PDU was encrypted with. SeqZero is derived from it.
    pub sequence: u32,
    pub data: Vec<u8>,
}

impl OutgoingSegmented {
    pub fn seq_zero(&self) -> u16 {
        (self.sequence & 0x1FFF) as u16
    }

    fn split(&self) -> Vec<Segment> {
        let size = self.kind.segment_size();
        let chunks: Vec<&[u8]> = if self.data.is_empty() {
            vec![&[][..]]
        } else {
            self.data.chunks(size).collect()
        };
        let seg_n = (chunks.len() - 1) as u8;
        chunks
            .into_iter()
            .enumerate()
            .map(|(seg_o, chunk)| Segment {
                kind: self.kind,
                seq_zero: self.seq_zero(),
                seg_o: seg_o as u8,
                seg_n,
                payload: chunk.to_vec(),
            })
            .collect()
    }
}

#[derive(Debug)]
struct Transfer {
    message: OutgoingSegmented,
    segments: Vec<Segment>,
    acknowledged: u32,
    unicast: bool,
    /// Next SegO to consider in the current pass.
    cursor: usize,
    pass_active: bool,
    final_pass: bool,
    first_sent: bool,
    retransmissions_left: u8,
    without_progress_left: u8,
}

impl Transfer {
    fn is_acknowledged(&self, seg_o: usize) -> bool {
        self.acknowledged & (1 << seg_o) != 0
    }

    fn is_complete(&self) -> bool {
        self.segments
            .iter()
            .enumerate()
            .all(|(seg_o, _)| self.is_acknowledged(seg_o))
    }

    fn next_pending(&self, from: usize) -> Option<usize> {
        (from..self.segments.len()).find(|seg_o| !self.is_acknowledged(*seg_o))
    }
}

#[derive(Debug, Default)]
pub struct SegmentTransmitter {
    transfers: HashMap<u32, Transfer>,
}

impl SegmentTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sending_to(&self, destination: Address) -> bool {
        self.transfers
            .values()
            .any(|t| t.message.destination == destination)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Starts transmitting `message`; the first segment goes out immediately.
    pub fn start(&mut self, message: OutgoingSegmented, params: &NetworkParameters, effects: &mut Effects) {
        let key = sar_key(message.source, message.seq_zero());
        let unicast = message.destination.is_unicast();
        let segments = message.split();
        debug!(
            id = message.id,
            destination = %message.destination,
            seq_zero = message.seq_zero(),
            segments = segments.len(),
            "Sending segmented message"
        );
        let transfer = Transfer {
            segments,
            acknowledged: 0,
            unicast,
            cursor: 0,
            pass_active: false,
            final_pass: !unicast && params.sar_multicast_retransmissions_count == 0,
            first_sent: false,
            retransmissions_left: if unicast {
                params.sar_unicast_retransmissions_count
            } else {
                params.sar_multicast_retransmissions_count
            },
            without_progress_left: params.sar_unicast_retransmissions_without_progress_count,
            message,
        };
        if let Some(previous) = self.transfers.insert(key, transfer) {
            warn!(id = previous.message.id, "SeqZero reused while a transfer was in progress");
            effects.push(completed(&previous.message, Err(LowerTransportError::Cancelled)));
        }
        self.start_pass(key, params, effects);
    }

    fn start_pass(&mut self, key: u32, params: &NetworkParameters, effects: &mut Effects) {
        if let Some(transfer) = self.transfers.get_mut(&key) {
            transfer.cursor = 0;
            transfer.pass_active = true;
        }
        self.send_next(key, params, effects);
    }

    fn send_next(&mut self, key: u32, params: &NetworkParameters, effects: &mut Effects) {
        let Some(transfer) = self.transfers.get_mut(&key) else {
            return;
        };
        if let Some(seg_o) = transfer.next_pending(transfer.cursor) {
            let sequence = (seg_o == 0 && !transfer.first_sent).then_some(transfer.message.sequence);
            if seg_o == 0 {
                transfer.first_sent = true;
            }
            trace!(seq_zero = transfer.message.seq_zero(), seg_o, "Sending segment");
            effects.transmit(OutgoingPdu {
                source: transfer.message.source,
                destination: transfer.message.destination,
                ttl: transfer.message.ttl,
                network_key_index: transfer.message.network_key_index,
                lower: LowerTransportPdu::Segment(transfer.segments[seg_o].clone()),
                sequence,
                send_id: Some(transfer.message.id),
            });
            transfer.cursor = seg_o + 1;
            if transfer.next_pending(transfer.cursor).is_some() {
                effects.schedule(TimerKey::SegmentPacing(key), params.sar_segment_interval());
                return;
            }
        }
        self.end_pass(key, params, effects);
    }

    fn end_pass(&mut self, key: u32, params: &NetworkParameters, effects: &mut Effects) {
        let Some(transfer) = self.transfers.get_mut(&key) else {
            return;
        };
        transfer.pass_active = false;
        if transfer.final_pass {
            let result = if transfer.unicast {
                debug!(id = transfer.message.id, "Retransmissions exhausted");
                Err(LowerTransportError::Timeout)
            } else {
                Ok(())
            };
            self.finish(key, result, effects);
            return;
        }
        if transfer.unicast {
            effects.schedule(
                TimerKey::UnicastRetransmission(key),
                params.sar_unicast_retransmissions_interval(transfer.message.ttl),
            );
        } else {
            effects.schedule(
                TimerKey::MulticastRetransmission(key),
                params.sar_multicast_retransmissions_interval(),
            );
        }
    }

    pub fn on_pacing_timer(&mut self, key: u32, params: &NetworkParameters, effects: &mut Effects) {
        if self.transfers.get(&key).is_some_and(|t| t.pass_active) {
            self.send_next(key, params, effects);
        }
    }

    pub fn on_unicast_timer(&mut self, key: u32, params: &NetworkParameters, effects: &mut Effects) {
        let Some(transfer) = self.transfers.get_mut(&key) else {
            return;
        };
        if transfer.retransmissions_left == 0 || transfer.without_progress_left == 0 {
            self.finish(key, Err(LowerTransportError::Timeout), effects);
            return;
        }
        transfer.retransmissions_left -= 1;
        transfer.without_progress_left -= 1;
        transfer.final_pass = transfer.retransmissions_left == 0 || transfer.without_progress_left == 0;
        trace!(
            id = transfer.message.id,
            left = transfer.retransmissions_left,
            "Retransmitting unacknowledged segments"
        );
        self.start_pass(key, params, effects);
    }

    pub fn on_multicast_timer(&mut self, key: u32, params: &NetworkParameters, effects: &mut Effects) {
        let Some(transfer) = self.transfers.get_mut(&key) else {
            return;
        };
        transfer.retransmissions_left = transfer.retransmissions_left.saturating_sub(1);
        transfer.final_pass = transfer.retransmissions_left == 0;
        self.start_pass(key, params, effects);
    }

    /// Applies a Segment Acknowledgment received from `from` for a transfer
    /// this node started.
    pub fn on_acknowledgment(
        &mut self,
        from: Address,
        local: Address,
        ack: &SegmentAcknowledgment,
        params: &NetworkParameters,
        effects: &mut Effects,
    ) {
        let key = sar_key(local, ack.seq_zero);
        let Some(transfer) = self.transfers.get_mut(&key) else {
            trace!(from = %from, seq_zero = ack.seq_zero, "Acknowledgment for unknown transfer");
            return;
        };
        if !transfer.unicast || transfer.message.destination != from {
            return;
        }
        if ack.is_busy() {
            debug!(id = transfer.message.id, "Receiver busy");
            self.finish(key, Err(LowerTransportError::Busy), effects);
            return;
        }
        let before = transfer.acknowledged;
        let mask = if transfer.segments.len() >= 32 {
            u32::MAX
        } else {
            (1u32 << transfer.segments.len()) - 1
        };
        transfer.acknowledged |= ack.block_ack & mask;
        if transfer.is_complete() {
            debug!(id = transfer.message.id, "Segmented message acknowledged");
            self.finish(key, Ok(()), effects);
            return;
        }
        if transfer.acknowledged == before {
            return;
        }
        transfer.without_progress_left = params.sar_unicast_retransmissions_without_progress_count;
        if transfer.pass_active || transfer.retransmissions_left == 0 {
            return;
        }
        // Progress: resend the gaps right away instead of waiting for the timer.
        effects.cancel(TimerKey::UnicastRetransmission(key));
        transfer.retransmissions_left -= 1;
        transfer.final_pass = transfer.retransmissions_left == 0;
        self.start_pass(key, params, effects);
    }

    /// Cancels the transfer belonging to `id`; a no-op when it already ended.
    pub fn cancel(&mut self, id: SendId, effects: &mut Effects) -> bool {
        let key = self
            .transfers
            .iter()
            .find(|(_, t)| t.message.id == id)
            .map(|(k, _)| *k);
        match key {
            Some(key) => {
                self.finish(key, Err(LowerTransportError::Cancelled), effects);
                true
            }
            None => false,
        }
    }

    /// Ends every transfer with `error`.
    pub fn abort_all(&mut self, error: LowerTransportError, effects: &mut Effects) {
        let keys: Vec<u32> = self.transfers.keys().copied().collect();
        for key in keys {
            self.finish(key, Err(error), effects);
        }
    }

    fn finish(&mut self, key: u32, result: Result<(), LowerTransportError>, effects: &mut Effects) {
        let Some(transfer) = self.transfers.remove(&key) else {
            return;
        };
        effects.cancel(TimerKey::SegmentPacing(key));
        effects.cancel(TimerKey::UnicastRetransmission(key));
        effects.cancel(TimerKey::MulticastRetransmission(key));
        effects.push(completed(&transfer.message, result));
    }
}

fn completed(message: &OutgoingSegmented, result: Result<(), LowerTransportError>) -> Effect {
    Effect::SegmentedCompleted {
        id: message.id,
        source: message.source,
        destination: message.destination,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: Address = Address(0x0001);
    const REMOTE: Address = Address(0x0002);

    fn message(destination: Address, len: usize) -> OutgoingSegmented {
        OutgoingSegmented {
            id: 1,
            source: LOCAL,
            destination,
            ttl: 5,
            network_key_index: 0,
            kind: SegmentKind::Access {
                aid: Some(0x26),
                szmic: false,
            },
            sequence: 0x0000_2005,
            data: (0..len as u8).collect(),
        }
    }

    fn transmitted(effects: &mut Effects) -> Vec<u8> {
        effects
            .drain()
            .filter_map(|e| match e {
                Effect::Transmit(OutgoingPdu {
                    lower: LowerTransportPdu::Segment(segment),
                    ..
                }) => Some(segment.seg_o),
                _ => None,
            })
            .collect()
    }

    fn outcome(effects: &Effects) -> Option<Result<(), LowerTransportError>> {
        effects.iter().find_map(|e| match e {
            Effect::SegmentedCompleted { result, .. } => Some(*result),
            _ => None,
        })
    }

    #[test]
    fn test_split_sizes() {
        let segments = message(REMOTE, 30).split();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].payload.len(), 6);
        assert!(segments.iter().all(|s| s.seg_n == 2 && s.seq_zero == 5));
    }

    #[test]
    fn test_first_segment_uses_message_sequence() {
        let params = NetworkParameters::default();
        let mut tx = SegmentTransmitter::new();
        let mut effects = Effects::new();
        tx.start(message(REMOTE, 20), &params, &mut effects);
        let first = effects.iter().find_map(|e| match e {
            Effect::Transmit(pdu) => Some(pdu.sequence),
            _ => None,
        });
        assert_eq!(first, Some(Some(0x2005)));
    }

    #[test]
    fn test_segments_are_paced() {
        let params = NetworkParameters::default();
        let mut tx = SegmentTransmitter::new();
        let mut effects = Effects::new();
        tx.start(message(REMOTE, 30), &params, &mut effects);
        assert_eq!(transmitted(&mut effects), vec![0]);

        let key = sar_key(LOCAL, 5);
        tx.on_pacing_timer(key, &params, &mut effects);
        assert_eq!(transmitted(&mut effects), vec![1]);
        tx.on_pacing_timer(key, &params, &mut effects);
        let last: Vec<Effect> = effects.drain().collect();
        assert!(last.iter().any(|e| matches!(e, Effect::Schedule { timer: TimerKey::UnicastRetransmission(k), .. } if *k == key)));
    }

    #[test]
    fn test_full_ack_completes() {
        let params = NetworkParameters::default();
        let mut tx = SegmentTransmitter::new();
        let mut effects = Effects::new();
        tx.start(message(REMOTE, 20), &params, &mut effects);
        effects.drain();

        let ack = SegmentAcknowledgment::new(5, [0, 1]);
        tx.on_acknowledgment(REMOTE, LOCAL, &ack, &params, &mut effects);
        assert_eq!(outcome(&effects), Some(Ok(())));
        assert!(tx.is_empty());
    }

    #[test]
    fn test_busy_ack_fails() {
        let params = NetworkParameters::default();
        let mut tx = SegmentTransmitter::new();
        let mut effects = Effects::new();
        tx.start(message(REMOTE, 20), &params, &mut effects);
        tx.on_acknowledgment(REMOTE, LOCAL, &SegmentAcknowledgment::busy(5), &params, &mut effects);
        assert_eq!(outcome(&effects), Some(Err(LowerTransportError::Busy)));
    }

    #[test]
    fn test_partial_ack_resends_only_missing() {
        let params = NetworkParameters::default();
        let mut tx = SegmentTransmitter::new();
        let mut effects = Effects::new();
        let key = sar_key(LOCAL, 5);
        tx.start(message(REMOTE, 30), &params, &mut effects);
        tx.on_pacing_timer(key, &params, &mut effects);
        tx.on_pacing_timer(key, &params, &mut effects);
        effects.drain();

        let ack = SegmentAcknowledgment::new(5, [0, 2]);
        tx.on_acknowledgment(REMOTE, LOCAL, &ack, &params, &mut effects);
        assert_eq!(transmitted(&mut effects), vec![1]);
    }

    #[test]
    fn test_retransmissions_exhausted() {
        let params = NetworkParameters::default();
        let mut tx = SegmentTransmitter::new();
        let mut effects = Effects::new();
        let key = sar_key(LOCAL, 5);
        tx.start(message(REMOTE, 20), &params, &mut effects);
        tx.on_pacing_timer(key, &params, &mut effects);
        assert_eq!(transmitted(&mut effects), vec![0, 1]);

        tx.on_unicast_timer(key, &params, &mut effects);
        tx.on_pacing_timer(key, &params, &mut effects);
        assert_eq!(transmitted(&mut effects), vec![0, 1]);

        tx.on_unicast_timer(key, &params, &mut effects);
        tx.on_pacing_timer(key, &params, &mut effects);
        let segments: Vec<Effect> = effects.drain().collect();
        assert_eq!(
            segments
                .iter()
                .filter(|e| matches!(e, Effect::Transmit(_)))
                .count(),
            2
        );
        assert!(segments.iter().any(|e| matches!(
            e,
            Effect::SegmentedCompleted {
                result: Err(LowerTransportError::Timeout),
                ..
            }
        )));
        assert!(tx.is_empty());
    }

    #[test]
    fn test_multicast_sent_count_plus_one_times() {
        let params = NetworkParameters::default();
        let mut tx = SegmentTransmitter::new();
        let mut effects = Effects::new();
        let key = sar_key(LOCAL, 5);
        tx.start(message(Address(0xC000), 10), &params, &mut effects);
        let mut sends = transmitted(&mut effects).len();
        for _ in 0..params.sar_multicast_retransmissions_count {
            tx.on_multicast_timer(key, &params, &mut effects);
            sends += transmitted(&mut effects).len();
        }
        assert_eq!(sends, usize::from(params.sar_multicast_retransmissions_count) + 1);
        assert!(tx.is_empty());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let params = NetworkParameters::default();
        let mut tx = SegmentTransmitter::new();
        let mut effects = Effects::new();
        tx.start(message(REMOTE, 20), &params, &mut effects);
        assert!(tx.cancel(1, &mut effects));
        assert_eq!(outcome(&effects), Some(Err(LowerTransportError::Cancelled)));
        assert!(!tx.cancel(1, &mut effects));
    }
}
