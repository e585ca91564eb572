//! Symmetric primitives used by the frame codec.
//!
//! Frames are encrypted with AES in CBC mode without padding (the codec pads
//! the plaintext itself).  The key length picks the variant: 16-byte keys
//! derived on the host use AES-128, while the 32-byte authentication key the
//! device hands out uses AES-256.  Key derivation is a single MD5 over the
//! input bytes.

pub mod keys;

use aes::{Aes128, Aes256};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::RngCore;

use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::{BLOCK_SIZE, IV_SIZE};

pub use keys::SessionKeys;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Key material for one of the session's symmetric keys.
#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            KeyMaterial::Aes128(k) => k,
            KeyMaterial::Aes256(k) => k,
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Aes128(_) => f.write_str("KeyMaterial::Aes128(..)"),
            KeyMaterial::Aes256(_) => f.write_str("KeyMaterial::Aes256(..)"),
        }
    }
}

/// MD5 digest of `data`.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// Fresh random IV from the OS RNG.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

fn require_blocks(data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::Cipher(format!(
            "data length {} is not a multiple of {BLOCK_SIZE}",
            data.len()
        )));
    }
    Ok(())
}

/// Encrypts block-aligned `plain` with AES-CBC.
///
/// # Errors
///
/// Returns [`ProtocolError::Cipher`] if `plain` is not block aligned.
pub fn encrypt_cbc(
    key: &KeyMaterial,
    iv: &[u8; IV_SIZE],
    plain: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    require_blocks(plain)?;
    let cipher_err = |e: cbc::cipher::InvalidLength| ProtocolError::Cipher(e.to_string());
    let out = match key {
        KeyMaterial::Aes128(k) => Aes128CbcEnc::new_from_slices(k, iv)
            .map_err(cipher_err)?
            .encrypt_padded_vec_mut::<NoPadding>(plain),
        KeyMaterial::Aes256(k) => Aes256CbcEnc::new_from_slices(k, iv)
            .map_err(cipher_err)?
            .encrypt_padded_vec_mut::<NoPadding>(plain),
    };
    Ok(out)
}

/// Decrypts block-aligned `cipher_text` with AES-CBC.
///
/// # Errors
///
/// Returns [`ProtocolError::Cipher`] if `cipher_text` is not block aligned.
pub fn decrypt_cbc(
    key: &KeyMaterial,
    iv: &[u8],
    cipher_text: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    require_blocks(cipher_text)?;
    let cipher_err = |e: cbc::cipher::InvalidLength| ProtocolError::Cipher(e.to_string());
    let unpad_err = |e: cbc::cipher::block_padding::UnpadError| ProtocolError::Cipher(e.to_string());
    match key {
        KeyMaterial::Aes128(k) => Aes128CbcDec::new_from_slices(k, iv)
            .map_err(cipher_err)?
            .decrypt_padded_vec_mut::<NoPadding>(cipher_text)
            .map_err(unpad_err),
        KeyMaterial::Aes256(k) => Aes256CbcDec::new_from_slices(k, iv)
            .map_err(cipher_err)?
            .decrypt_padded_vec_mut::<NoPadding>(cipher_text)
            .map_err(unpad_err),
    }
}
