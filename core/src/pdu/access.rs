//! Access PDU: opcode followed by parameters.
//!
//! Opcodes are 1 byte (`0xxxxxxx`, 0x7F reserved), 2 bytes (`10xxxxxx`) or
//! 3 bytes (`11xxxxxx` + 16-bit company identifier).

use super::{ensure_len, PduError};

/// Length of an opcode on the wire.
pub fn opcode_len(opcode: u32) -> Result<usize, PduError> {
    match opcode {
        0x7F => Err(PduError::ReservedOpcode(opcode)),
        0x00..=0x7E => Ok(1),
        0x8000..=0xBFFF => Ok(2),
        0xC0_0000..=0xFF_FFFF => Ok(3),
        _ => Err(PduError::InvalidOpcode(opcode)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPdu {
    pub opcode: u32,
    pub parameters: Vec<u8>,
}

impl AccessPdu {
    pub fn new(opcode: u32, parameters: Vec<u8>) -> Result<Self, PduError> {
        opcode_len(opcode)?;
        Ok(Self { opcode, parameters })
    }

    pub fn len(&self) -> usize {
        opcode_len(self.opcode).unwrap_or(0) + self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = opcode_len(self.opcode).unwrap_or(3);
        let bytes = self.opcode.to_be_bytes();
        let mut out = Vec::with_capacity(size + self.parameters.len());
        out.extend_from_slice(&bytes[4 - size..]);
        out.extend_from_slice(&self.parameters);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        ensure_len(data, 1)?;
        let size = match data[0] {
            0x7F => return Err(PduError::ReservedOpcode(0x7F)),
            b if b & 0x80 == 0 => 1,
            b if b & 0xC0 == 0x80 => 2,
            _ => 3,
        };
        ensure_len(data, size)?;
        let opcode = data[..size]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        Ok(Self {
            opcode,
            parameters: data[size..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_opcode_sizes() {
        assert_eq!(opcode_len(0x00).unwrap(), 1);
        assert_eq!(opcode_len(0x8202).unwrap(), 2);
        assert_eq!(opcode_len(0xD50A00).unwrap(), 3);
        assert_eq!(opcode_len(0x7F), Err(PduError::ReservedOpcode(0x7F)));
        assert_eq!(opcode_len(0x0100), Err(PduError::InvalidOpcode(0x0100)));
    }

    #[test]
    fn test_vendor_opcode_sample() {
        let data = hex::decode("D50A0048656C6C6F").unwrap();
        let pdu = AccessPdu::decode(&data).unwrap();
        assert_eq!(pdu.opcode, 0xD50A00);
        assert_eq!(pdu.parameters, b"Hello");
        assert_eq!(pdu.encode(), data);
    }

    #[test]
    fn test_decode_rejects_reserved_and_truncated() {
        assert_eq!(AccessPdu::decode(&[0x7F, 0x01]), Err(PduError::ReservedOpcode(0x7F)));
        assert!(matches!(
            AccessPdu::decode(&[0xC1, 0x00]),
            Err(PduError::TooShort { expected: 3, .. })
        ));
    }

    fn valid_opcode() -> impl Strategy<Value = u32> {
        prop_oneof![0u32..0x7F, 0x8000u32..=0xBFFF, 0xC0_0000u32..=0xFF_FFFF]
    }

    proptest! {
        #[test]
        fn prop_access_round_trip(
            opcode in valid_opcode(),
            parameters in proptest::collection::vec(any::<u8>(), 0..=377),
        ) {
            let pdu = AccessPdu::new(opcode, parameters).unwrap();
            prop_assert_eq!(AccessPdu::decode(&pdu.encode()).unwrap(), pdu);
        }
    }
}
