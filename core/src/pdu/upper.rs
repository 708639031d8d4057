//! Upper Transport access PDU encryption.
//!
//! The Access PDU is encrypted with an application key (application nonce,
//! 0x01) or a device key (device nonce, 0x02). The TransMIC is 64 bits only
//! for segmented messages that request it (SZMIC = 1).

use crate::address::Address;
use crate::crypto::{self, Key128, MicSize, Nonce};

use super::PduError;

/// Largest Access PDU with a 32-bit TransMIC (32 segments × 12 bytes − 4).
pub const MAX_ACCESS_PDU_SIZE: usize = 380;
/// Access PDUs above this size cannot use a 64-bit TransMIC unsegmented.
pub const MAX_UNSEGMENTED_ACCESS_PAYLOAD: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Application,
    Device,
}

/// Fields shared by the application and device nonces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpperTransportHeader {
    pub kind: KeyKind,
    /// SZMIC of the segmented header; always false for unsegmented PDUs.
    pub aszmic: bool,
    /// SEQ of the message (of its first segment, when segmented).
    pub sequence: u32,
    pub source: Address,
    pub destination: Address,
    pub iv_index: u32,
}

impl UpperTransportHeader {
    pub fn trans_mic(&self) -> MicSize {
        if self.aszmic {
            MicSize::Long
        } else {
            MicSize::Short
        }
    }

    fn nonce(&self) -> Nonce {
        let mut nonce = [0u8; 13];
        nonce[0] = match self.kind {
            KeyKind::Application => 0x01,
            KeyKind::Device => 0x02,
        };
        nonce[1] = u8::from(self.aszmic) << 7;
        nonce[2..5].copy_from_slice(&self.sequence.to_be_bytes()[1..4]);
        nonce[5..7].copy_from_slice(&self.source.0.to_be_bytes());
        nonce[7..9].copy_from_slice(&self.destination.0.to_be_bytes());
        nonce[9..13].copy_from_slice(&self.iv_index.to_be_bytes());
        nonce
    }
}

/// Encrypts an Access PDU. `label` is the Label UUID of a virtual destination.
pub fn encrypt(
    header: &UpperTransportHeader,
    key: &Key128,
    access_pdu: &[u8],
    label: Option<&[u8; 16]>,
) -> Result<Vec<u8>, PduError> {
    let max = match header.trans_mic() {
        MicSize::Short => MAX_ACCESS_PDU_SIZE,
        MicSize::Long => MAX_ACCESS_PDU_SIZE - 4,
    };
    if access_pdu.len() > max {
        return Err(PduError::TooLong {
            max,
            actual: access_pdu.len(),
        });
    }
    let aad: &[u8] = label.map(|l| l.as_slice()).unwrap_or(&[]);
    Ok(crypto::encrypt(
        key,
        &header.nonce(),
        access_pdu,
        aad,
        header.trans_mic(),
    )?)
}

/// Decrypts an Upper Transport PDU with one candidate key.
pub fn decrypt(
    header: &UpperTransportHeader,
    key: &Key128,
    upper_transport_pdu: &[u8],
    label: Option<&[u8; 16]>,
) -> Result<Vec<u8>, PduError> {
    let aad: &[u8] = label.map(|l| l.as_slice()).unwrap_or(&[]);
    Ok(crypto::decrypt(
        key,
        &header.nonce(),
        upper_transport_pdu,
        aad,
        header.trans_mic(),
    )?)
}
