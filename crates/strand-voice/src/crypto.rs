// Voice packet encryption (AES-256-GCM, RTP header as nonce and AAD).

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use crate::packet::RTP_HEADER_SIZE;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;
/// GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;
/// Nonce size for AES-GCM (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("secret key must be {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (authentication error)")]
    DecryptionFailed,
    #[error("ciphertext too short")]
    CiphertextTooShort,
}

/// The 12-byte RTP header doubles as the nonce; sequence and timestamp make
/// it unique per packet of one sender.
fn build_nonce(header: &[u8; RTP_HEADER_SIZE]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(header);
    nonce
}

/// Cipher for one voice session's secret key.
pub struct PacketCipher {
    cipher: Aes256Gcm,
}

impl PacketCipher {
    pub fn new(secret_key: &[u8]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(secret_key)
            .map_err(|_| CryptoError::InvalidKeyLength(secret_key.len()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a payload. The header is authenticated but not encrypted.
    /// Returns the ciphertext with the GCM tag appended.
    pub fn encrypt(
        &self,
        header: &[u8; RTP_HEADER_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = build_nonce(header);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    pub fn decrypt(
        &self,
        header: &[u8; RTP_HEADER_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort);
        }
        let nonce_bytes = build_nonce(header);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketCipher { .. }")
    }
}
