//! In-memory credential directory.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::application::credentials::{CredentialResolver, DeviceCredentials};
use crate::infrastructure::storage::config::{ConfigError, DeviceEntry};

/// Credentials keyed by device address.  Addresses compare case-insensitively.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    entries: RwLock<HashMap<String, DeviceCredentials>>,
}

fn normalize(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from the `[[devices]]` table of the config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCredentials`] if an entry is incomplete.
    pub fn from_entries(entries: &[DeviceEntry]) -> Result<Self, ConfigError> {
        let store = Self::new();
        for entry in entries {
            store.insert(&entry.address, entry.credentials.clone())?;
        }
        Ok(store)
    }

    /// Adds or replaces the credentials for `address`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCredentials`] if a required field is empty.
    pub fn insert(&self, address: &str, credentials: DeviceCredentials) -> Result<(), ConfigError> {
        let missing = credentials.missing_fields();
        if !missing.is_empty() {
            return Err(ConfigError::InvalidCredentials(format!(
                "{address}: missing {}",
                missing.join(", ")
            )));
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize(address), credentials);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialStore {
    async fn credentials(
        &self,
        address: &str,
        force_update: bool,
    ) -> Result<Option<DeviceCredentials>, String> {
        // Nothing to refresh from; a forced update returns the same entry.
        debug!("{address}: credential lookup (force_update: {force_update})");
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&normalize(address)).cloned())
    }
}
