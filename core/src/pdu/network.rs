//! Network PDU
//!
//! ```text
//! | IVI:1 NID:7 | CTL:1 TTL:7 | SEQ:24 | SRC:16 | DST:16 | TransportPDU | NetMIC:32/64 |
//!               \_____________ obfuscated ____/ \_________ encrypted ____________/
//! ```
//!
//! The NetMIC is 64 bits for control messages and 32 bits for access messages.

use crate::address::Address;
use crate::crypto::{self, MicSize, Nonce};
use crate::keys::{IvIndex, NetworkKeyDerivatives};

use super::{ensure_len, PduError};

/// Smallest valid Network PDU: header, DST, one transport byte, 32-bit MIC.
pub const MIN_PDU_LENGTH: usize = 14;
/// Smallest valid control Network PDU (64-bit MIC).
pub const MIN_CONTROL_PDU_LENGTH: usize = 18;
/// Largest transport PDU carried in one Network PDU.
pub const MAX_TRANSPORT_PDU_LENGTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceType {
    Network = 0x00,
    Proxy = 0x03,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Full IV Index the PDU is (or was) encrypted with.
    pub iv_index: u32,
    pub nid: u8,
    pub control: bool,
    pub ttl: u8,
    pub sequence: u32,
    pub source: Address,
    pub destination: Address,
    pub transport_pdu: Vec<u8>,
}

impl NetworkPdu {
    pub fn ivi(&self) -> u8 {
        (self.iv_index & 1) as u8
    }

    fn mic_size(control: bool) -> MicSize {
        if control {
            MicSize::Long
        } else {
            MicSize::Short
        }
    }

    fn header(&self) -> [u8; 6] {
        let seq = self.sequence.to_be_bytes();
        let src = self.source.0.to_be_bytes();
        [
            (u8::from(self.control) << 7) | (self.ttl & 0x7F),
            seq[1],
            seq[2],
            seq[3],
            src[0],
            src[1],
        ]
    }

    fn nonce(nonce_type: NonceType, header: &[u8; 6], iv_index: u32) -> Nonce {
        let mut nonce = [0u8; 13];
        nonce[0] = nonce_type as u8;
        nonce[1..7].copy_from_slice(header);
        if nonce_type == NonceType::Proxy {
            nonce[1] = 0x00;
        }
        nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
        nonce
    }

    /// IVI and NID of a raw PDU, used to pick candidate keys.
    pub fn peek_ivi_nid(raw: &[u8]) -> Option<(u8, u8)> {
        raw.first().map(|b| (b >> 7, b & 0x7F))
    }

    /// Encrypts and obfuscates the PDU.
    pub fn encode(
        &self,
        keys: &NetworkKeyDerivatives,
        nonce_type: NonceType,
    ) -> Result<Vec<u8>, PduError> {
        if self.transport_pdu.is_empty() || self.transport_pdu.len() > MAX_TRANSPORT_PDU_LENGTH {
            return Err(PduError::InvalidField("transport PDU length"));
        }
        let header = self.header();
        let nonce = Self::nonce(nonce_type, &header, self.iv_index);

        let mut plaintext = Vec::with_capacity(2 + self.transport_pdu.len());
        plaintext.extend_from_slice(&self.destination.0.to_be_bytes());
        plaintext.extend_from_slice(&self.transport_pdu);
        let encrypted = crypto::encrypt(
            &keys.encryption_key,
            &nonce,
            &plaintext,
            &[],
            Self::mic_size(self.control),
        )?;

        let mut privacy_random = [0u8; 7];
        privacy_random.copy_from_slice(&encrypted[0..7]);
        let obfuscated = crypto::obfuscate(&header, &privacy_random, self.iv_index, &keys.privacy_key);

        let mut pdu = Vec::with_capacity(7 + encrypted.len());
        pdu.push((self.ivi() << 7) | (keys.nid & 0x7F));
        pdu.extend_from_slice(&obfuscated);
        pdu.extend_from_slice(&encrypted);
        Ok(pdu)
    }

    /// Deobfuscates and decrypts a raw PDU with one candidate key.
    pub fn decode(
        raw: &[u8],
        keys: &NetworkKeyDerivatives,
        iv_index: &IvIndex,
        nonce_type: NonceType,
    ) -> Result<Self, PduError> {
        ensure_len(raw, MIN_PDU_LENGTH)?;
        let ivi = raw[0] >> 7;
        let nid = raw[0] & 0x7F;
        if nid != keys.nid {
            return Err(PduError::NidMismatch);
        }
        let index = iv_index
            .receive_index(ivi)
            .ok_or(PduError::IvIndexMismatch(ivi))?;

        let mut obfuscated = [0u8; 6];
        obfuscated.copy_from_slice(&raw[1..7]);
        let mut privacy_random = [0u8; 7];
        privacy_random.copy_from_slice(&raw[7..14]);
        let header = crypto::obfuscate(&obfuscated, &privacy_random, index, &keys.privacy_key);

        let control = header[0] >> 7 == 1;
        if control {
            ensure_len(raw, MIN_CONTROL_PDU_LENGTH)?;
        }
        let ttl = header[0] & 0x7F;
        let sequence = u32::from_be_bytes([0, header[1], header[2], header[3]]);
        let source = Address(u16::from_be_bytes([header[4], header[5]]));

        let nonce = Self::nonce(nonce_type, &header, index);
        let plaintext = crypto::decrypt(
            &keys.encryption_key,
            &nonce,
            &raw[7..],
            &[],
            Self::mic_size(control),
        )?;
        // Only a proxy configuration message may come from an unassigned-looking
        // source; network PDUs must come from a unicast element.
        if nonce_type == NonceType::Network && !source.is_unicast() {
            return Err(PduError::InvalidSource(source));
        }
        ensure_len(&plaintext, 3)?;
        let destination = Address(u16::from_be_bytes([plaintext[0], plaintext[1]]));

        Ok(NetworkPdu {
            iv_index: index,
            nid,
            control,
            ttl,
            sequence,
            source,
            destination,
            transport_pdu: plaintext[2..].to_vec(),
        })
    }
}
