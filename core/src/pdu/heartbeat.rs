//! Heartbeat transport control message (opcode 0x0A).

use super::{ensure_len, lower::LowerTransportPdu, PduError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// TTL the heartbeat was sent with; hops = init_ttl - received TTL + 1.
    pub init_ttl: u8,
    /// Relay, Proxy, Friend and Low Power feature bits.
    pub features: u16,
}

impl Heartbeat {
    pub const OPCODE: u8 = 0x0A;

    pub fn hops(&self, received_ttl: u8) -> u8 {
        self.init_ttl.saturating_sub(received_ttl).saturating_add(1)
    }

    pub fn parameters(&self) -> Vec<u8> {
        let mut parameters = vec![self.init_ttl & 0x7F];
        parameters.extend_from_slice(&self.features.to_be_bytes());
        parameters
    }

    pub fn to_pdu(&self) -> LowerTransportPdu {
        LowerTransportPdu::Control {
            opcode: Self::OPCODE,
            parameters: self.parameters(),
        }
    }

    pub fn from_parameters(parameters: &[u8]) -> Result<Self, PduError> {
        ensure_len(parameters, 3)?;
        Ok(Self {
            init_ttl: parameters[0] & 0x7F,
            features: u16::from_be_bytes([parameters[1], parameters[2]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_codec() {
        let heartbeat = Heartbeat {
            init_ttl: 5,
            features: 0x0003,
        };
        let LowerTransportPdu::Control { opcode, parameters } = heartbeat.to_pdu() else {
            panic!("expected control");
        };
        assert_eq!(opcode, 0x0A);
        assert_eq!(parameters, vec![0x05, 0x00, 0x03]);
        assert_eq!(Heartbeat::from_parameters(&parameters).unwrap(), heartbeat);
        assert_eq!(heartbeat.hops(3), 3);
    }
}
