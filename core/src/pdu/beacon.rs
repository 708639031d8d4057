//! Secure Network beacon.
//!
//! ```text
//! | 0x01 | Flags | Network ID (8) | IV Index (4) | Authentication (8) |
//! ```
//! Flags: bit 0 Key Refresh, bit 1 IV Update. The authentication value is the
//! first 8 bytes of AES-CMAC(BeaconKey, Flags || Network ID || IV Index).

use crate::crypto::{self, Key128};

use super::{ensure_len, PduError};

pub const SECURE_NETWORK_BEACON: u8 = 0x01;
pub const BEACON_LENGTH: usize = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureNetworkBeacon {
    pub key_refresh: bool,
    pub iv_update_active: bool,
    pub network_id: [u8; 8],
    pub iv_index: u32,
}

impl SecureNetworkBeacon {
    fn flags(&self) -> u8 {
        u8::from(self.key_refresh) | (u8::from(self.iv_update_active) << 1)
    }

    fn authenticated_part(&self) -> [u8; 13] {
        let mut data = [0u8; 13];
        data[0] = self.flags();
        data[1..9].copy_from_slice(&self.network_id);
        data[9..13].copy_from_slice(&self.iv_index.to_be_bytes());
        data
    }

    fn authentication(&self, beacon_key: &Key128) -> [u8; 8] {
        let mac = crypto::aes_cmac(beacon_key, &self.authenticated_part());
        let mut auth = [0u8; 8];
        auth.copy_from_slice(&mac[..8]);
        auth
    }

    pub fn encode(&self, beacon_key: &Key128) -> Vec<u8> {
        let mut out = Vec::with_capacity(BEACON_LENGTH);
        out.push(SECURE_NETWORK_BEACON);
        out.extend_from_slice(&self.authenticated_part());
        out.extend_from_slice(&self.authentication(beacon_key));
        out
    }

    /// Parses a beacon without authenticating it.
    pub fn decode(data: &[u8]) -> Result<(Self, [u8; 8]), PduError> {
        ensure_len(data, 1)?;
        if data[0] != SECURE_NETWORK_BEACON {
            return Err(PduError::UnsupportedBeacon(data[0]));
        }
        ensure_len(data, BEACON_LENGTH)?;
        let mut network_id = [0u8; 8];
        network_id.copy_from_slice(&data[2..10]);
        let mut auth = [0u8; 8];
        auth.copy_from_slice(&data[14..22]);
        let beacon = Self {
            key_refresh: data[1] & 0x01 != 0,
            iv_update_active: data[1] & 0x02 != 0,
            network_id,
            iv_index: u32::from_be_bytes([data[10], data[11], data[12], data[13]]),
        };
        Ok((beacon, auth))
    }

    pub fn authenticate(&self, auth: &[u8; 8], beacon_key: &Key128) -> bool {
        &self.authentication(beacon_key) == auth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NetworkKeyDerivatives;

    const BEACON: &str = "0102EE6C0EFF5298ECFF000000025E5AA7B268B5E044";

    fn derivatives() -> NetworkKeyDerivatives {
        let key: Key128 = hex::decode("8D65C0771C83FAC39E256F697EA3AAE1")
            .unwrap()
            .try_into()
            .unwrap();
        NetworkKeyDerivatives::derive(&key)
    }

    #[test]
    fn test_decode_and_authenticate_sample() {
        let keys = derivatives();
        let (beacon, auth) = SecureNetworkBeacon::decode(&hex::decode(BEACON).unwrap()).unwrap();
        assert_eq!(hex::encode_upper(beacon.network_id), "EE6C0EFF5298ECFF");
        assert_eq!(beacon.network_id, keys.network_id);
        assert_eq!(beacon.iv_index, 2);
        assert!(beacon.iv_update_active);
        assert!(!beacon.key_refresh);
        assert!(beacon.authenticate(&auth, &keys.beacon_key));
        assert!(!beacon.authenticate(&auth, &[0u8; 16]));
        assert_eq!(hex::encode_upper(beacon.encode(&keys.beacon_key)), BEACON);
    }

    #[test]
    fn test_unprovisioned_beacon_is_unsupported() {
        assert_eq!(
            SecureNetworkBeacon::decode(&[0x00; 19]),
            Err(PduError::UnsupportedBeacon(0x00))
        );
    }
}
