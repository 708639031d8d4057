// AES-CCM authenticated encryption and AES-ECB header obfuscation.
//
// Mesh always uses a 13-byte nonce (L = 2) and either a 4 or an 8 byte MIC.
// The MIC is appended to the ciphertext, the same way it travels on the air.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use ccm::aead::AeadInPlace;
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use serde::{Deserialize, Serialize};

use super::{CryptoError, Key128};

type Aes128Ccm32 = Ccm<Aes128, U4, U13>;
type Aes128Ccm64 = Ccm<Aes128, U8, U13>;

/// Nonce shared by all mesh CCM operations.
pub type Nonce = [u8; 13];

/// Size of the Message Integrity Check appended by CCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MicSize {
    /// 32-bit MIC (access NetMIC, short TransMIC)
    Short,
    /// 64-bit MIC (control NetMIC, long TransMIC)
    Long,
}

impl MicSize {
    pub fn len(self) -> usize {
        match self {
            MicSize::Short => 4,
            MicSize::Long => 8,
        }
    }
}

/// Encrypts `plaintext` and returns `ciphertext || MIC`.
pub fn encrypt(
    key: &Key128,
    nonce: &Nonce,
    plaintext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    let mut buffer = plaintext.to_vec();
    let key = GenericArray::from_slice(key);
    let nonce = GenericArray::from_slice(nonce);
    let tag = match mic {
        MicSize::Short => Aes128Ccm32::new(key)
            .encrypt_in_place_detached(nonce, aad, &mut buffer)
            .map(|tag| tag.to_vec()),
        MicSize::Long => Aes128Ccm64::new(key)
            .encrypt_in_place_detached(nonce, aad, &mut buffer)
            .map(|tag| tag.to_vec()),
    }
    .map_err(|_| CryptoError::MessageTooLong)?;
    buffer.extend_from_slice(&tag);
    Ok(buffer)
}

/// Decrypts `ciphertext || MIC`. A wrong key, nonce or AAD surfaces as
/// [`CryptoError::MicMismatch`].
pub fn decrypt(
    key: &Key128,
    nonce: &Nonce,
    data: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < mic.len() {
        return Err(CryptoError::TooShort(data.len()));
    }
    let (ciphertext, tag) = data.split_at(data.len() - mic.len());
    let mut buffer = ciphertext.to_vec();
    let key = GenericArray::from_slice(key);
    let nonce = GenericArray::from_slice(nonce);
    match mic {
        MicSize::Short => Aes128Ccm32::new(key).decrypt_in_place_detached(
            nonce,
            aad,
            &mut buffer,
            GenericArray::from_slice(tag),
        ),
        MicSize::Long => Aes128Ccm64::new(key).decrypt_in_place_detached(
            nonce,
            aad,
            &mut buffer,
            GenericArray::from_slice(tag),
        ),
    }
    .map_err(|_| CryptoError::MicMismatch)?;
    Ok(buffer)
}

/// Single-block AES-128 encryption.
pub fn aes_ecb(key: &Key128, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// XORs the six header bytes (CTL|TTL, SEQ, SRC) with
/// PECB = e(privacyKey, 0x0000000000 || IV Index || privacyRandom).
///
/// `privacy_random` is the first 7 bytes of the encrypted DST+TransportPDU+MIC.
/// The operation is its own inverse.
pub fn obfuscate(
    header: &[u8; 6],
    privacy_random: &[u8; 7],
    iv_index: u32,
    privacy_key: &Key128,
) -> [u8; 6] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(privacy_random);
    let pecb = aes_ecb(privacy_key, &block);

    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = header[i] ^ pecb[i];
    }
    out
}
