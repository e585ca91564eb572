//! The three per-session keys and the flag → key lookup.
//!
//! ```text
//! pairing secret ──► local key (first 6 bytes) ──MD5──► login key    (flag 4)
//!                                 │
//!             device salt ────────┴──────────MD5──► session key  (flag 5)
//!
//! device-info response ──────────────────────────► auth key     (flag 1)
//! ```
//!
//! The login key exists as soon as credentials are known.  The other two are
//! only filled in by [`SessionKeys::apply_device_info`] and are dropped again
//! by [`SessionKeys::reset_session`] whenever the link goes away, so a
//! reconnect always repeats the full handshake.

use crate::crypto::{md5_digest, KeyMaterial};
use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::{DeviceInfo, SecurityFlag, LOCAL_KEY_SIZE};

#[derive(Debug, Clone, Default)]
pub struct SessionKeys {
    local_key: Vec<u8>,
    login_key: Option<KeyMaterial>,
    session_key: Option<KeyMaterial>,
    auth_key: Option<KeyMaterial>,
}

impl SessionKeys {
    /// Key store with nothing derived yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives the login key from the first six bytes of the pairing secret.
    pub fn from_pairing_secret(secret: &str) -> Self {
        let bytes = secret.as_bytes();
        let local_key = bytes[..bytes.len().min(LOCAL_KEY_SIZE)].to_vec();
        let login_key = KeyMaterial::Aes128(md5_digest(&local_key));
        Self {
            local_key,
            login_key: Some(login_key),
            session_key: None,
            auth_key: None,
        }
    }

    /// The pairing-secret bytes that feed key derivation.
    pub fn local_key(&self) -> &[u8] {
        &self.local_key
    }

    /// Installs the session and auth keys carried by a device-info response.
    pub fn apply_device_info(&mut self, info: &DeviceInfo) {
        let mut seed = Vec::with_capacity(self.local_key.len() + info.salt.len());
        seed.extend_from_slice(&self.local_key);
        seed.extend_from_slice(&info.salt);
        self.session_key = Some(KeyMaterial::Aes128(md5_digest(&seed)));
        self.auth_key = Some(KeyMaterial::Aes256(info.auth_key));
    }

    /// Forgets the post-handshake keys; the login key survives.
    pub fn reset_session(&mut self) {
        self.session_key = None;
        self.auth_key = None;
    }

    pub fn has_session(&self) -> bool {
        self.session_key.is_some()
    }

    /// Looks up the key selected by `flag`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KeyUnavailable`] if the key has not been
    /// derived yet.  Callers treat this as a contract violation, not a
    /// transient failure.
    pub fn key_for(&self, flag: SecurityFlag) -> Result<&KeyMaterial, ProtocolError> {
        let key = match flag {
            SecurityFlag::Auth => self.auth_key.as_ref(),
            SecurityFlag::Login => self.login_key.as_ref(),
            SecurityFlag::Session => self.session_key.as_ref(),
        };
        key.ok_or(ProtocolError::KeyUnavailable(flag))
    }
}
