// Incoming segmented message reassembly.
//
// One context per (source, SeqZero). Every received segment re-arms two timers:
//   incomplete timer  -> the context is discarded silently on expiry
//   acknowledgment    -> a cumulative BlockAck is sent on expiry
// Once complete, the final acknowledgment is remembered per source so late
// retransmissions of the same message are answered without reassembling again.

use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::address::Address;
use crate::config::NetworkParameters;
use crate::effect::{sar_key, Effects, OutgoingPdu, TimerKey};
use crate::keys::KeyIndex;
use crate::pdu::{Segment, SegmentAcknowledgment, SegmentKind};

/// Reconstructs the SEQ of a message's first segment from any segment's SEQ
/// and the 13-bit SeqZero.
pub fn message_sequence(sequence: u32, seq_zero: u16) -> u32 {
    let seq_zero = u32::from(seq_zero & 0x1FFF);
    let base = (sequence & 0x00FF_E000) | seq_zero;
    if sequence & 0x1FFF < seq_zero {
        base.wrapping_sub(0x2000) & 0x00FF_FFFF
    } else {
        base
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingSegment {
    pub source: Address,
    pub destination: Address,
    pub ttl: u8,
    /// SEQ of the Network PDU carrying this segment.
    pub sequence: u32,
    pub iv_index: u32,
    pub network_key_index: KeyIndex,
    pub segment: Segment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    pub source: Address,
    pub destination: Address,
    pub ttl: u8,
    /// SEQ of the first segment; part of SeqAuth and the transport nonce.
    pub sequence: u32,
    pub iv_index: u32,
    pub network_key_index: KeyIndex,
    pub kind: SegmentKind,
    pub seq_zero: u16,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Context {
    source: Address,
    destination: Address,
    ttl: u8,
    sequence: u32,
    iv_index: u32,
    network_key_index: KeyIndex,
    kind: SegmentKind,
    seq_zero: u16,
    seg_n: u8,
    segments: Vec<Option<Vec<u8>>>,
    received: u32,
    created: Instant,
    send_acks: bool,
    ack_retransmissions_left: u8,
}

impl Context {
    fn is_complete(&self) -> bool {
        self.segments.iter().all(Option::is_some)
    }

    fn acknowledgment(&self) -> SegmentAcknowledgment {
        SegmentAcknowledgment {
            obo: false,
            seq_zero: self.seq_zero,
            block_ack: self.received,
        }
    }
}

#[derive(Debug)]
struct CompletedAck {
    seq_zero: u16,
    pdu: OutgoingPdu,
    last_sent: Option<Instant>,
    retransmissions_left: u8,
}

#[derive(Debug, Default)]
pub struct Reassembler {
    contexts: HashMap<u32, Context>,
    completed: HashMap<Address, CompletedAck>,
}

fn ack_pdu(
    ack: SegmentAcknowledgment,
    local: Address,
    remote: Address,
    received_ttl: u8,
    network_key_index: KeyIndex,
    params: &NetworkParameters,
) -> OutgoingPdu {
    OutgoingPdu {
        source: local,
        destination: remote,
        ttl: if received_ttl == 0 { 0 } else { params.default_ttl },
        network_key_index,
        lower: ack.to_pdu(),
        sequence: None,
        send_id: None,
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_progress(&self, source: Address, seq_zero: u16) -> bool {
        self.contexts.contains_key(&sar_key(source, seq_zero))
    }

    /// Whether `(source, seq_zero)` is the last message completed from `source`.
    pub fn is_completed(&self, source: Address, seq_zero: u16) -> bool {
        self.completed
            .get(&source)
            .is_some_and(|c| c.seq_zero == seq_zero)
    }

    /// Whether a segmented message from `source` is being received.
    pub fn is_receiving_from(&self, source: Address) -> bool {
        self.contexts.values().any(|c| c.source == source)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Handles one segment. `send_acks` is true when the destination is a
    /// local unicast element.
    pub fn handle(
        &mut self,
        incoming: IncomingSegment,
        send_acks: bool,
        params: &NetworkParameters,
        now: Instant,
        effects: &mut Effects,
    ) -> Option<ReassembledMessage> {
        let segment = &incoming.segment;
        let key = sar_key(incoming.source, segment.seq_zero);

        if !self.contexts.contains_key(&key) {
            if let Some(completed) = self.completed.get_mut(&incoming.source) {
                if completed.seq_zero == segment.seq_zero {
                    let interval = params.complete_acknowledgment_interval();
                    let due = completed
                        .last_sent
                        .map(|t| now.duration_since(t) >= interval)
                        .unwrap_or(true);
                    if send_acks && due {
                        trace!(source = %incoming.source, seq_zero = segment.seq_zero, "Resending acknowledgment for completed message");
                        completed.last_sent = Some(now);
                        effects.transmit(completed.pdu.clone());
                    }
                    return None;
                }
                self.completed.remove(&incoming.source);
            }
        }

        let sequence = message_sequence(incoming.sequence, segment.seq_zero);

        if segment.seg_n == 0 {
            let message = ReassembledMessage {
                source: incoming.source,
                destination: incoming.destination,
                ttl: incoming.ttl,
                sequence,
                iv_index: incoming.iv_index,
                network_key_index: incoming.network_key_index,
                kind: segment.kind,
                seq_zero: segment.seq_zero,
                data: segment.payload.clone(),
            };
            if send_acks {
                let ack = SegmentAcknowledgment::new(segment.seq_zero, [0]);
                self.complete(
                    incoming.source,
                    ack_pdu(ack, incoming.destination, incoming.source, incoming.ttl, incoming.network_key_index, params),
                    segment.seq_zero,
                    0,
                    params,
                    now,
                    effects,
                );
            }
            return Some(message);
        }

        if let Some(context) = self.contexts.get(&key) {
            if context.seg_n != segment.seg_n {
                debug!(source = %incoming.source, seq_zero = segment.seq_zero, "SegN changed; discarding reassembly context");
                self.discard(key, effects);
                return None;
            }
        } else {
            self.evict_if_full(incoming.source, params.max_reassembly_contexts_per_source, effects);
            trace!(source = %incoming.source, seq_zero = segment.seq_zero, seg_n = segment.seg_n, "New reassembly context");
            self.contexts.insert(
                key,
                Context {
                    source: incoming.source,
                    destination: incoming.destination,
                    ttl: incoming.ttl,
                    sequence,
                    iv_index: incoming.iv_index,
                    network_key_index: incoming.network_key_index,
                    kind: segment.kind,
                    seq_zero: segment.seq_zero,
                    seg_n: segment.seg_n,
                    segments: vec![None; usize::from(segment.seg_n) + 1],
                    received: 0,
                    created: now,
                    send_acks,
                    ack_retransmissions_left: 0,
                },
            );
        }

        let context = self.contexts.get_mut(&key)?;
        let index = usize::from(segment.seg_o);
        if context.segments[index].is_none() {
            context.segments[index] = Some(segment.payload.clone());
            context.received |= 1 << segment.seg_o;
        }

        effects.schedule(TimerKey::ReassemblyDiscard(key), params.sar_discard_timeout());

        if !context.is_complete() {
            if context.send_acks {
                effects.schedule(
                    TimerKey::ReassemblyAck(key),
                    params.acknowledgment_timer_interval(context.seg_n),
                );
            }
            return None;
        }

        let context = self.contexts.remove(&key)?;
        effects.cancel(TimerKey::ReassemblyDiscard(key));
        effects.cancel(TimerKey::ReassemblyAck(key));
        if context.send_acks {
            let pdu = ack_pdu(
                context.acknowledgment(),
                context.destination,
                context.source,
                context.ttl,
                context.network_key_index,
                params,
            );
            self.complete(context.source, pdu, context.seq_zero, context.seg_n, params, now, effects);
        }
        let data = context.segments.into_iter().flatten().flatten().collect();
        debug!(source = %context.source, seq_zero = context.seq_zero, "Segmented message reassembled");
        Some(ReassembledMessage {
            source: context.source,
            destination: context.destination,
            ttl: context.ttl,
            sequence: context.sequence,
            iv_index: context.iv_index,
            network_key_index: context.network_key_index,
            kind: context.kind,
            seq_zero: context.seq_zero,
            data,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &mut self,
        source: Address,
        pdu: OutgoingPdu,
        seq_zero: u16,
        seg_n: u8,
        params: &NetworkParameters,
        now: Instant,
        effects: &mut Effects,
    ) {
        effects.transmit(pdu.clone());
        let retransmissions_left = if seg_n > params.sar_segments_threshold {
            params.sar_acknowledgment_retransmissions_count
        } else {
            0
        };
        let key = sar_key(source, seq_zero);
        if retransmissions_left > 0 {
            effects.schedule(
                TimerKey::AckRetransmission(key),
                params.sar_segment_reception_interval(),
            );
        }
        self.completed.insert(
            source,
            CompletedAck {
                seq_zero,
                pdu,
                last_sent: Some(now),
                retransmissions_left,
            },
        );
    }

    fn evict_if_full(&mut self, source: Address, max: usize, effects: &mut Effects) {
        let mut mine: Vec<(u32, Instant)> = self
            .contexts
            .iter()
            .filter(|(_, c)| c.source == source)
            .map(|(k, c)| (*k, c.created))
            .collect();
        if mine.len() < max.max(1) {
            return;
        }
        mine.sort_by_key(|(_, created)| *created);
        let excess = mine.len() + 1 - max.max(1);
        for (key, _) in mine.into_iter().take(excess) {
            debug!(source = %source, "Evicting oldest reassembly context");
            self.discard(key, effects);
        }
    }

    fn discard(&mut self, key: u32, effects: &mut Effects) {
        self.contexts.remove(&key);
        effects.cancel(TimerKey::ReassemblyDiscard(key));
        effects.cancel(TimerKey::ReassemblyAck(key));
        effects.cancel(TimerKey::AckRetransmission(key));
    }

    /// The incomplete timer expired: drop the message silently.
    pub fn on_discard_timer(&mut self, key: u32, effects: &mut Effects) {
        if let Some(context) = self.contexts.get(&key) {
            debug!(source = %context.source, seq_zero = context.seq_zero, "Incomplete timer expired; message discarded");
            self.discard(key, effects);
        }
    }

    pub fn on_ack_timer(&mut self, key: u32, params: &NetworkParameters, effects: &mut Effects) {
        let Some(context) = self.contexts.get_mut(&key) else {
            return;
        };
        if !context.send_acks {
            return;
        }
        trace!(source = %context.source, block_ack = context.received, "Sending segment acknowledgment");
        effects.transmit(ack_pdu(
            context.acknowledgment(),
            context.destination,
            context.source,
            context.ttl,
            context.network_key_index,
            params,
        ));
        if context.seg_n > params.sar_segments_threshold
            && params.sar_acknowledgment_retransmissions_count > 0
        {
            context.ack_retransmissions_left = params.sar_acknowledgment_retransmissions_count;
            effects.schedule(
                TimerKey::AckRetransmission(key),
                params.sar_segment_reception_interval(),
            );
        }
    }

    pub fn on_ack_retransmission(&mut self, key: u32, params: &NetworkParameters, effects: &mut Effects) {
        if let Some(context) = self.contexts.get_mut(&key) {
            if context.ack_retransmissions_left == 0 {
                return;
            }
            context.ack_retransmissions_left -= 1;
            effects.transmit(ack_pdu(
                context.acknowledgment(),
                context.destination,
                context.source,
                context.ttl,
                context.network_key_index,
                params,
            ));
            if context.ack_retransmissions_left > 0 {
                effects.schedule(TimerKey::AckRetransmission(key), params.sar_segment_reception_interval());
            }
            return;
        }
        let source = Address((key >> 16) as u16);
        if let Some(completed) = self.completed.get_mut(&source) {
            if sar_key(source, completed.seq_zero) != key || completed.retransmissions_left == 0 {
                return;
            }
            completed.retransmissions_left -= 1;
            effects.transmit(completed.pdu.clone());
            if completed.retransmissions_left > 0 {
                effects.schedule(TimerKey::AckRetransmission(key), params.sar_segment_reception_interval());
            }
        }
    }

    pub fn clear(&mut self) {
        self.contexts.clear();
        self.completed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::pdu::LowerTransportPdu;
    use std::time::Duration;

    const SRC: Address = Address(0x0003);
    const DST: Address = Address(0x1201);

    fn segment(seq_zero: u16, seg_o: u8, seg_n: u8, payload: &[u8]) -> IncomingSegment {
        IncomingSegment {
            source: SRC,
            destination: DST,
            ttl: 4,
            sequence: 0x3129AB + u32::from(seg_o),
            iv_index: 0x1234_5678,
            network_key_index: 0,
            segment: Segment {
                kind: SegmentKind::Access {
                    aid: None,
                    szmic: false,
                },
                seq_zero,
                seg_o,
                seg_n,
                payload: payload.to_vec(),
            },
        }
    }

    fn acks(effects: &Effects) -> Vec<SegmentAcknowledgment> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Transmit(OutgoingPdu {
                    lower: LowerTransportPdu::Control { opcode: 0, parameters },
                    ..
                }) => SegmentAcknowledgment::from_parameters(parameters).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_message_sequence() {
        assert_eq!(message_sequence(0x3129AC, 0x9AB), 0x3129AB);
        assert_eq!(message_sequence(0x3129AB, 0x9AB), 0x3129AB);
        // SeqZero from before a 0x2000 boundary.
        assert_eq!(message_sequence(0x002001, 0x1FFF), 0x001FFF);
    }

    #[test]
    fn test_two_segments_in_reverse_order() {
        let params = NetworkParameters::default();
        let mut reassembler = Reassembler::new();
        let mut effects = Effects::new();
        let now = Instant::now();

        assert!(reassembler
            .handle(segment(0x9AB, 1, 1, &[4, 5]), true, &params, now, &mut effects)
            .is_none());
        assert!(reassembler.is_in_progress(SRC, 0x9AB));
        assert!(reassembler.is_receiving_from(SRC));

        let message = reassembler
            .handle(segment(0x9AB, 0, 1, &[1; 12]), true, &params, now, &mut effects)
            .unwrap();
        let mut expected = vec![1; 12];
        expected.extend_from_slice(&[4, 5]);
        assert_eq!(message.data, expected);
        assert_eq!(message.sequence, 0x3129AB);
        assert_eq!(reassembler.context_count(), 0);

        let acks = acks(&effects);
        assert_eq!(acks.len(), 1);
        assert!(acks[0].is_complete(1));
    }

    #[test]
    fn test_duplicate_of_completed_message_is_acknowledged_again() {
        let params = NetworkParameters::default();
        let mut reassembler = Reassembler::new();
        let mut effects = Effects::new();
        let now = Instant::now();

        reassembler.handle(segment(7, 0, 1, &[0; 12]), true, &params, now, &mut effects);
        reassembler.handle(segment(7, 1, 1, &[1]), true, &params, now, &mut effects);
        effects.drain();

        // Within the complete-ack interval: no resend.
        assert!(reassembler
            .handle(segment(7, 1, 1, &[1]), true, &params, now, &mut effects)
            .is_none());
        assert!(acks(&effects).is_empty());

        let later = now + Duration::from_millis(200);
        assert!(reassembler
            .handle(segment(7, 1, 1, &[1]), true, &params, later, &mut effects)
            .is_none());
        assert_eq!(acks(&effects).len(), 1);
    }

    #[test]
    fn test_seg_n_mismatch_discards_context() {
        let params = NetworkParameters::default();
        let mut reassembler = Reassembler::new();
        let mut effects = Effects::new();
        let now = Instant::now();

        reassembler.handle(segment(3, 0, 2, &[0; 12]), true, &params, now, &mut effects);
        assert!(reassembler
            .handle(segment(3, 1, 3, &[0; 12]), true, &params, now, &mut effects)
            .is_none());
        assert!(!reassembler.is_in_progress(SRC, 3));
    }

    #[test]
    fn test_oldest_context_evicted() {
        let params = NetworkParameters {
            max_reassembly_contexts_per_source: 2,
            ..Default::default()
        };
        let mut reassembler = Reassembler::new();
        let mut effects = Effects::new();
        let now = Instant::now();

        reassembler.handle(segment(1, 0, 1, &[0; 12]), false, &params, now, &mut effects);
        reassembler.handle(segment(2, 0, 1, &[0; 12]), false, &params, now + Duration::from_millis(1), &mut effects);
        reassembler.handle(segment(3, 0, 1, &[0; 12]), false, &params, now + Duration::from_millis(2), &mut effects);
        assert!(!reassembler.is_in_progress(SRC, 1));
        assert!(reassembler.is_in_progress(SRC, 2));
        assert!(reassembler.is_in_progress(SRC, 3));
    }

    #[test]
    fn test_discard_timer_drops_context() {
        let params = NetworkParameters::default();
        let mut reassembler = Reassembler::new();
        let mut effects = Effects::new();

        reassembler.handle(segment(9, 0, 2, &[0; 12]), true, &params, Instant::now(), &mut effects);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Schedule { timer: TimerKey::ReassemblyDiscard(_), after } if *after == Duration::from_secs(10)
        )));
        reassembler.on_discard_timer(sar_key(SRC, 9), &mut effects);
        assert_eq!(reassembler.context_count(), 0);
    }

    #[test]
    fn test_ack_timer_reports_partial_block_ack() {
        let params = NetworkParameters::default();
        let mut reassembler = Reassembler::new();
        let mut effects = Effects::new();

        reassembler.handle(segment(9, 0, 2, &[0; 12]), true, &params, Instant::now(), &mut effects);
        reassembler.handle(segment(9, 2, 2, &[0; 3]), true, &params, Instant::now(), &mut effects);
        effects.drain();
        reassembler.on_ack_timer(sar_key(SRC, 9), &params, &mut effects);
        let acks = acks(&effects);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].block_ack, 0b101);
    }

    #[test]
    fn test_no_ack_for_group_destination() {
        let params = NetworkParameters::default();
        let mut reassembler = Reassembler::new();
        let mut effects = Effects::new();

        reassembler.handle(segment(4, 0, 0, &[0; 8]), false, &params, Instant::now(), &mut effects);
        assert!(acks(&effects).is_empty());
    }
}
