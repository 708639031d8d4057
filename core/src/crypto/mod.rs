// Mesh security primitives
//
// Every security operation in a mesh network reduces to AES-128:
//   AES-CMAC -> salts (s1), key derivation (k1..k4), beacon authentication
//   AES-CCM  -> network and transport encryption with 32/64-bit MICs
//   AES-ECB  -> network header obfuscation (PECB)

pub mod cipher;
pub mod kdf;

use thiserror::Error;

pub use cipher::{aes_ecb, decrypt, encrypt, obfuscate, MicSize, Nonce};
pub use kdf::{
    aes_cmac, beacon_key, identity_key, k1, k2, k3, k4, s1, virtual_address,
    NetworkKeyMaterial,
};

/// A 128-bit key, salt or virtual label.
pub type Key128 = [u8; 16];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("MIC mismatch")]
    MicMismatch,
    #[error("Ciphertext of {0} bytes is shorter than its MIC")]
    TooShort(usize),
    #[error("Plaintext too long for AES-CCM with a 13-byte nonce")]
    MessageTooLong,
}
