// Key derivation functions built on AES-CMAC.
//
//   s1(M)          = AES-CMAC(ZERO, M)
//   k1(N, SALT, P) = AES-CMAC(AES-CMAC(SALT, N), P)
//   k2(N, P)       -> NID || EncryptionKey || PrivacyKey
//   k3(N)          -> 64-bit Network ID
//   k4(N)          -> 6-bit AID

use aes::Aes128;
use cmac::{Cmac, Mac};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::Key128;

/// AES-CMAC over `data`.
pub fn aes_cmac(key: &Key128, data: &[u8]) -> Key128 {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Salt generation function.
pub fn s1(m: &[u8]) -> Key128 {
    aes_cmac(&[0u8; 16], m)
}

pub fn k1(n: &[u8], salt: &Key128, p: &[u8]) -> Key128 {
    let t = aes_cmac(salt, n);
    aes_cmac(&t, p)
}

/// Material derived from a Network Key by k2.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct NetworkKeyMaterial {
    pub nid: u8,
    pub encryption_key: Key128,
    pub privacy_key: Key128,
}

impl std::fmt::Debug for NetworkKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkKeyMaterial")
            .field("nid", &format_args!("{:#04x}", self.nid))
            .finish_non_exhaustive()
    }
}

/// Derives NID, encryption and privacy keys. `p` is `[0x00]` for the
/// managed flooding credentials.
pub fn k2(n: &Key128, p: &[u8]) -> NetworkKeyMaterial {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, n);

    let mut input = Vec::with_capacity(16 + p.len() + 1);
    input.extend_from_slice(p);
    input.push(0x01);
    let t1 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t1);
    input.extend_from_slice(p);
    input.push(0x02);
    let t2 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t2);
    input.extend_from_slice(p);
    input.push(0x03);
    let t3 = aes_cmac(&t, &input);

    NetworkKeyMaterial {
        nid: t1[15] & 0x7F,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// Network ID.
pub fn k3(n: &Key128) -> [u8; 8] {
    let t = aes_cmac(&s1(b"smk3"), n);
    let out = aes_cmac(&t, b"id64\x01");
    let mut id = [0u8; 8];
    id.copy_from_slice(&out[8..16]);
    id
}

/// Application key identifier.
pub fn k4(n: &Key128) -> u8 {
    let t = aes_cmac(&s1(b"smk4"), n);
    aes_cmac(&t, b"id6\x01")[15] & 0x3F
}

/// IdentityKey used by Node Identity advertising.
pub fn identity_key(n: &Key128) -> Key128 {
    k1(n, &s1(b"nkik"), b"id128\x01")
}

/// BeaconKey used to authenticate Secure Network beacons.
pub fn beacon_key(n: &Key128) -> Key128 {
    k1(n, &s1(b"nkbk"), b"id128\x01")
}

/// Hashes a Label UUID into a 16-bit virtual address (0x8000..=0xBFFF).
pub fn virtual_address(label: &Key128) -> u16 {
    let hash = aes_cmac(&s1(b"vtad"), label);
    (u16::from_be_bytes([hash[14], hash[15]]) | 0x8000) & 0xBFFF
}
