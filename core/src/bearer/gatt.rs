//! Proxy protocol segmentation over a GATT connection.
//!
//! Every proxy PDU starts with one header byte: SAR in bits 7-6 and the
//! message type in bits 5-0. Messages longer than the ATT MTU allows are
//! carried as a first segment, any number of continuations and a last one.

use tracing::debug;

use super::PduType;

/// 16-bit Mesh Proxy Service UUID.
pub const MESH_PROXY_SERVICE_UUID: u16 = 0x1828;
/// Data In characteristic (client writes).
pub const MESH_PROXY_DATA_IN: u16 = 0x2ADD;
/// Data Out characteristic (server notifies).
pub const MESH_PROXY_DATA_OUT: u16 = 0x2ADE;

/// Smallest ATT payload that can carry a header and one data byte.
pub const MIN_MTU: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sar {
    Complete = 0b00,
    First = 0b01,
    Continuation = 0b10,
    Last = 0b11,
}

impl Sar {
    fn from_header(header: u8) -> Self {
        match header >> 6 {
            0b00 => Sar::Complete,
            0b01 => Sar::First,
            0b10 => Sar::Continuation,
            _ => Sar::Last,
        }
    }

    fn header(self, pdu_type: PduType) -> u8 {
        ((self as u8) << 6) | (pdu_type as u8 & 0x3F)
    }
}

/// Splits outgoing messages and reassembles incoming ones.
///
/// One handler serves one connection; the reassembly buffer holds at most one
/// message at a time.
#[derive(Debug, Default)]
pub struct ProxyProtocolHandler {
    buffer: Option<(PduType, Vec<u8>)>,
}

impl ProxyProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `data` into packets of at most `mtu` bytes each.
    pub fn segment(data: &[u8], pdu_type: PduType, mtu: usize) -> Vec<Vec<u8>> {
        let payload = mtu.max(MIN_MTU) - 1;
        if data.len() <= payload {
            let mut packet = Vec::with_capacity(data.len() + 1);
            packet.push(Sar::Complete.header(pdu_type));
            packet.extend_from_slice(data);
            return vec![packet];
        }

        let chunks: Vec<&[u8]> = data.chunks(payload).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let sar = match i {
                    0 => Sar::First,
                    i if i == last => Sar::Last,
                    _ => Sar::Continuation,
                };
                let mut packet = Vec::with_capacity(chunk.len() + 1);
                packet.push(sar.header(pdu_type));
                packet.extend_from_slice(chunk);
                packet
            })
            .collect()
    }

    /// Feeds one received packet. Returns a message once it is complete.
    pub fn reassemble(&mut self, packet: &[u8]) -> Option<(Vec<u8>, PduType)> {
        let (&header, data) = packet.split_first()?;
        let Some(pdu_type) = PduType::from_u8(header & 0x3F) else {
            debug!(header, "Dropping proxy PDU with unknown message type");
            return None;
        };

        match Sar::from_header(header) {
            Sar::Complete => {
                if self.buffer.take().is_some() {
                    debug!("Incomplete proxy PDU discarded");
                }
                Some((data.to_vec(), pdu_type))
            }
            Sar::First => {
                if self.buffer.is_some() {
                    debug!("Incomplete proxy PDU discarded");
                }
                self.buffer = Some((pdu_type, data.to_vec()));
                None
            }
            sar @ (Sar::Continuation | Sar::Last) => {
                match self.buffer.as_mut() {
                    Some((buffered, bytes)) if *buffered == pdu_type => bytes.extend_from_slice(data),
                    _ => {
                        debug!(%pdu_type, "Unexpected proxy PDU segment");
                        self.buffer = None;
                        return None;
                    }
                }
                if sar == Sar::Last {
                    self.buffer.take().map(|(pdu_type, bytes)| (bytes, pdu_type))
                } else {
                    None
                }
            }
        }
    }

    /// Drops any partially received message.
    pub fn reset(&mut self) {
        self.buffer = None;
    }
}
