//! Proxy configuration messages exchanged with a GATT Proxy node.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;

use super::{ensure_len, PduError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProxyFilterType {
    /// Only listed destinations are forwarded.
    #[default]
    AcceptList = 0x00,
    /// Listed destinations are not forwarded.
    RejectList = 0x01,
}

impl fmt::Display for ProxyFilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyFilterType::AcceptList => write!(f, "accept list"),
            ProxyFilterType::RejectList => write!(f, "reject list"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfigurationMessage {
    SetFilterType(ProxyFilterType),
    AddAddresses(Vec<Address>),
    RemoveAddresses(Vec<Address>),
    FilterStatus {
        filter_type: ProxyFilterType,
        list_size: u16,
    },
}

impl ProxyConfigurationMessage {
    pub const SET_FILTER_TYPE: u8 = 0x00;
    pub const ADD_ADDRESSES: u8 = 0x01;
    pub const REMOVE_ADDRESSES: u8 = 0x02;
    pub const FILTER_STATUS: u8 = 0x03;

    pub fn opcode(&self) -> u8 {
        match self {
            Self::SetFilterType(_) => Self::SET_FILTER_TYPE,
            Self::AddAddresses(_) => Self::ADD_ADDRESSES,
            Self::RemoveAddresses(_) => Self::REMOVE_ADDRESSES,
            Self::FilterStatus { .. } => Self::FILTER_STATUS,
        }
    }

    /// Transport PDU of the proxy configuration Network PDU.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            Self::SetFilterType(filter_type) => out.push(*filter_type as u8),
            Self::AddAddresses(addresses) | Self::RemoveAddresses(addresses) => {
                for address in addresses {
                    out.extend_from_slice(&address.0.to_be_bytes());
                }
            }
            Self::FilterStatus {
                filter_type,
                list_size,
            } => {
                out.push(*filter_type as u8);
                out.extend_from_slice(&list_size.to_be_bytes());
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, PduError> {
        ensure_len(data, 1)?;
        let parameters = &data[1..];
        let filter_type = |b: u8| match b {
            0x00 => Ok(ProxyFilterType::AcceptList),
            0x01 => Ok(ProxyFilterType::RejectList),
            _ => Err(PduError::InvalidField("proxy filter type")),
        };
        let addresses = |p: &[u8]| -> Result<Vec<Address>, PduError> {
            if p.len() % 2 != 0 {
                return Err(PduError::InvalidField("address list"));
            }
            Ok(p.chunks_exact(2)
                .map(|c| Address(u16::from_be_bytes([c[0], c[1]])))
                .collect())
        };
        match data[0] {
            Self::SET_FILTER_TYPE => {
                ensure_len(parameters, 1)?;
                Ok(Self::SetFilterType(filter_type(parameters[0])?))
            }
            Self::ADD_ADDRESSES => Ok(Self::AddAddresses(addresses(parameters)?)),
            Self::REMOVE_ADDRESSES => Ok(Self::RemoveAddresses(addresses(parameters)?)),
            Self::FILTER_STATUS => {
                ensure_len(parameters, 3)?;
                Ok(Self::FilterStatus {
                    filter_type: filter_type(parameters[0])?,
                    list_size: u16::from_be_bytes([parameters[1], parameters[2]]),
                })
            }
            other => Err(PduError::InvalidOpcode(u32::from(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_addresses_encoding() {
        let msg = ProxyConfigurationMessage::AddAddresses(vec![Address(0x0001), Address(0xC000)]);
        assert_eq!(msg.encode(), vec![0x01, 0x00, 0x01, 0xC0, 0x00]);
        assert_eq!(ProxyConfigurationMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_filter_status_decoding() {
        let msg = ProxyConfigurationMessage::decode(&[0x03, 0x01, 0x00, 0x06]).unwrap();
        assert_eq!(
            msg,
            ProxyConfigurationMessage::FilterStatus {
                filter_type: ProxyFilterType::RejectList,
                list_size: 6
            }
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(ProxyConfigurationMessage::decode(&[0x01, 0x00]).is_err());
        assert!(ProxyConfigurationMessage::decode(&[0x00, 0x02]).is_err());
        assert_eq!(
            ProxyConfigurationMessage::decode(&[0x09]),
            Err(PduError::InvalidOpcode(9))
        );
    }
}
