//! Lower Transport PDUs.
//!
//! ```text
//! Unsegmented access   | SEG=0 AKF AID:6 | Upper Transport PDU (5..=15)  |
//! Unsegmented control  | SEG=0 OPCODE:7  | Parameters (0..=11)           |
//! Segmented access     | SEG=1 AKF AID:6 | SZMIC SeqZero:13 SegO:5 SegN:5 | Segment (1..=12) |
//! Segmented control    | SEG=1 OPCODE:7  | RFU   SeqZero:13 SegO:5 SegN:5 | Segment (1..=8)  |
//! ```

use super::{ensure_len, PduError};

/// Payload carried by one access segment.
pub const ACCESS_SEGMENT_SIZE: usize = 12;
/// Payload carried by one control segment.
pub const CONTROL_SEGMENT_SIZE: usize = 8;
/// Largest Upper Transport PDU sent unsegmented.
pub const MAX_UNSEGMENTED_ACCESS_SIZE: usize = 15;
/// Largest control message parameters sent unsegmented.
pub const MAX_UNSEGMENTED_CONTROL_SIZE: usize = 11;
/// SegN is 5 bits.
pub const MAX_SEGMENTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// `aid` is `None` for device-key messages (AKF = 0).
    Access { aid: Option<u8>, szmic: bool },
    Control { opcode: u8 },
}

impl SegmentKind {
    pub fn is_control(&self) -> bool {
        matches!(self, SegmentKind::Control { .. })
    }

    pub fn segment_size(&self) -> usize {
        match self {
            SegmentKind::Access { .. } => ACCESS_SEGMENT_SIZE,
            SegmentKind::Control { .. } => CONTROL_SEGMENT_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub seq_zero: u16,
    pub seg_o: u8,
    pub seg_n: u8,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn is_last(&self) -> bool {
        self.seg_o == self.seg_n
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    Access {
        aid: Option<u8>,
        upper_transport_pdu: Vec<u8>,
    },
    Control {
        opcode: u8,
        parameters: Vec<u8>,
    },
    Segment(Segment),
}

fn akf_aid(aid: Option<u8>) -> u8 {
    match aid {
        Some(aid) => 0x40 | (aid & 0x3F),
        None => 0x00,
    }
}

fn aid_from(octet: u8) -> Option<u8> {
    (octet & 0x40 != 0).then_some(octet & 0x3F)
}

impl LowerTransportPdu {
    pub fn is_control(&self) -> bool {
        match self {
            LowerTransportPdu::Access { .. } => false,
            LowerTransportPdu::Control { .. } => true,
            LowerTransportPdu::Segment(segment) => segment.kind.is_control(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LowerTransportPdu::Access {
                aid,
                upper_transport_pdu,
            } => {
                let mut out = Vec::with_capacity(1 + upper_transport_pdu.len());
                out.push(akf_aid(*aid));
                out.extend_from_slice(upper_transport_pdu);
                out
            }
            LowerTransportPdu::Control { opcode, parameters } => {
                let mut out = Vec::with_capacity(1 + parameters.len());
                out.push(opcode & 0x7F);
                out.extend_from_slice(parameters);
                out
            }
            LowerTransportPdu::Segment(segment) => {
                let (first, flag) = match segment.kind {
                    SegmentKind::Access { aid, szmic } => (0x80 | akf_aid(aid), u8::from(szmic)),
                    SegmentKind::Control { opcode } => (0x80 | (opcode & 0x7F), 0),
                };
                let seq_zero = segment.seq_zero & 0x1FFF;
                let mut out = Vec::with_capacity(4 + segment.payload.len());
                out.push(first);
                out.push((flag << 7) | (seq_zero >> 6) as u8);
                out.push((((seq_zero & 0x3F) as u8) << 2) | ((segment.seg_o & 0x1F) >> 3));
                out.push(((segment.seg_o & 0x07) << 5) | (segment.seg_n & 0x1F));
                out.extend_from_slice(&segment.payload);
                out
            }
        }
    }

    /// Decodes a transport PDU; `control` is the CTL bit of its Network PDU.
    pub fn decode(data: &[u8], control: bool) -> Result<Self, PduError> {
        ensure_len(data, 1)?;
        let segmented = data[0] & 0x80 != 0;

        if !segmented {
            if control {
                return Ok(LowerTransportPdu::Control {
                    opcode: data[0] & 0x7F,
                    parameters: data[1..].to_vec(),
                });
            }
            ensure_len(data, 6)?;
            return Ok(LowerTransportPdu::Access {
                aid: aid_from(data[0]),
                upper_transport_pdu: data[1..].to_vec(),
            });
        }

        ensure_len(data, 5)?;
        let seq_zero = (u16::from(data[1] & 0x7F) << 6) | u16::from(data[2] >> 2);
        let seg_o = ((data[2] & 0x03) << 3) | (data[3] >> 5);
        let seg_n = data[3] & 0x1F;
        if seg_o > seg_n {
            return Err(PduError::InvalidSegment { seg_o, seg_n });
        }
        let kind = if control {
            SegmentKind::Control {
                opcode: data[0] & 0x7F,
            }
        } else {
            SegmentKind::Access {
                aid: aid_from(data[0]),
                szmic: data[1] & 0x80 != 0,
            }
        };
        let payload = &data[4..];
        if payload.len() > kind.segment_size() {
            return Err(PduError::TooLong {
                max: 4 + kind.segment_size(),
                actual: data.len(),
            });
        }
        Ok(LowerTransportPdu::Segment(Segment {
            kind,
            seq_zero,
            seg_o,
            seg_n,
            payload: payload.to_vec(),
        }))
    }
}

// ============================================================================
// SEGMENT ACKNOWLEDGMENT
// ============================================================================

/// Control message 0x00 acknowledging received segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAcknowledgment {
    /// Set by a Friend acknowledging on behalf of a Low Power node.
    pub obo: bool,
    pub seq_zero: u16,
    pub block_ack: u32,
}

impl SegmentAcknowledgment {
    pub const OPCODE: u8 = 0x00;

    /// Acknowledgment for the given received segment indices.
    pub fn new(seq_zero: u16, received: impl IntoIterator<Item = u8>) -> Self {
        let block_ack = received
            .into_iter()
            .fold(0u32, |acc, seg_o| acc | (1 << (seg_o & 0x1F)));
        Self {
            obo: false,
            seq_zero,
            block_ack,
        }
    }

    /// A receiver unable to accept the message answers with an empty BlockAck.
    pub fn busy(seq_zero: u16) -> Self {
        Self {
            obo: false,
            seq_zero,
            block_ack: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.block_ack == 0
    }

    pub fn is_acknowledged(&self, seg_o: u8) -> bool {
        self.block_ack & (1 << (seg_o & 0x1F)) != 0
    }

    pub fn is_complete(&self, seg_n: u8) -> bool {
        let mask = if seg_n >= 31 {
            u32::MAX
        } else {
            (1u32 << (seg_n + 1)) - 1
        };
        self.block_ack & mask == mask
    }

    pub fn parameters(&self) -> Vec<u8> {
        let seq_zero = self.seq_zero & 0x1FFF;
        let mut out = Vec::with_capacity(6);
        out.push((u8::from(self.obo) << 7) | (seq_zero >> 6) as u8);
        out.push(((seq_zero & 0x3F) as u8) << 2);
        out.extend_from_slice(&self.block_ack.to_be_bytes());
        out
    }

    pub fn from_parameters(parameters: &[u8]) -> Result<Self, PduError> {
        ensure_len(parameters, 6)?;
        Ok(Self {
            obo: parameters[0] & 0x80 != 0,
            seq_zero: (u16::from(parameters[0] & 0x7F) << 6) | u16::from(parameters[1] >> 2),
            block_ack: u32::from_be_bytes([
                parameters[2],
                parameters[3],
                parameters[4],
                parameters[5],
            ]),
        })
    }

    pub fn to_pdu(&self) -> LowerTransportPdu {
        LowerTransportPdu::Control {
            opcode: Self::OPCODE,
            parameters: self.parameters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_segment_header_sample() {
        let pdu = LowerTransportPdu::decode(&hex::decode("8026ac21cfdc18c52fdef772e0e17308").unwrap(), false).unwrap();
        let LowerTransportPdu::Segment(segment) = &pdu else {
            panic!("expected a segment");
        };
        assert_eq!(segment.seq_zero, 0x9AB);
        assert_eq!(segment.seg_o, 1);
        assert_eq!(segment.seg_n, 1);
        assert_eq!(
            segment.kind,
            SegmentKind::Access {
                aid: None,
                szmic: false
            }
        );
        assert!(segment.is_last());
        assert_eq!(hex::encode(pdu.encode()), "8026ac21cfdc18c52fdef772e0e17308");
    }

    #[test]
    fn test_unsegmented_access_with_aid() {
        let data = hex::decode("663871B904D431526316CA48A0").unwrap();
        let pdu = LowerTransportPdu::decode(&data, false).unwrap();
        assert_eq!(
            pdu,
            LowerTransportPdu::Access {
                aid: Some(0x26),
                upper_transport_pdu: data[1..].to_vec(),
            }
        );
    }

    #[test]
    fn test_rejects_seg_o_above_seg_n() {
        // SegO 2, SegN 1
        let data = [0x80, 0x00, 0x00, 0x41, 0xAA];
        assert_eq!(
            LowerTransportPdu::decode(&data, false),
            Err(PduError::InvalidSegment { seg_o: 2, seg_n: 1 })
        );
    }

    #[test]
    fn test_rejects_short_access() {
        assert!(matches!(
            LowerTransportPdu::decode(&[0x00, 1, 2, 3, 4], false),
            Err(PduError::TooShort { expected: 6, .. })
        ));
    }

    #[test]
    fn test_segment_acknowledgment() {
        let ack = SegmentAcknowledgment::new(0x9AB, [0, 1, 3]);
        assert_eq!(ack.block_ack, 0b1011);
        assert!(ack.is_acknowledged(3));
        assert!(!ack.is_acknowledged(2));
        assert!(!ack.is_complete(3));
        assert!(SegmentAcknowledgment::new(1, [0, 1, 2, 3]).is_complete(3));
        assert!(SegmentAcknowledgment::new(1, 0..32).is_complete(31));

        let encoded = ack.to_pdu().encode();
        assert_eq!(encoded.len(), 7);
        let LowerTransportPdu::Control { opcode, parameters } =
            LowerTransportPdu::decode(&encoded, true).unwrap()
        else {
            panic!("expected control");
        };
        assert_eq!(opcode, SegmentAcknowledgment::OPCODE);
        assert_eq!(SegmentAcknowledgment::from_parameters(&parameters).unwrap(), ack);
        assert!(SegmentAcknowledgment::busy(1).is_busy());
    }

    fn segment_kind() -> impl Strategy<Value = SegmentKind> {
        prop_oneof![
            (proptest::option::of(0u8..64), any::<bool>())
                .prop_map(|(aid, szmic)| SegmentKind::Access { aid, szmic }),
            (1u8..128).prop_map(|opcode| SegmentKind::Control { opcode }),
        ]
    }

    proptest! {
        #[test]
        fn prop_segment_round_trip(
            kind in segment_kind(),
            seq_zero in 0u16..0x2000,
            (seg_o, seg_n) in (0u8..32).prop_flat_map(|n| (0..=n, Just(n))),
            len in 1usize..=8,
        ) {
            let pdu = LowerTransportPdu::Segment(Segment {
                kind,
                seq_zero,
                seg_o,
                seg_n,
                payload: vec![0xA5; len],
            });
            let decoded = LowerTransportPdu::decode(&pdu.encode(), kind.is_control()).unwrap();
            prop_assert_eq!(decoded, pdu);
        }

        #[test]
        fn prop_unsegmented_access_round_trip(
            aid in proptest::option::of(0u8..64),
            upper in proptest::collection::vec(any::<u8>(), 5..=15),
        ) {
            let pdu = LowerTransportPdu::Access { aid, upper_transport_pdu: upper };
            prop_assert_eq!(LowerTransportPdu::decode(&pdu.encode(), false).unwrap(), pdu);
        }
    }
}
