//! Per-device credentials and the directory that resolves them.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything the engine needs to know about a device before connecting.
///
/// `local_key` is the pairing secret; only its first six bytes enter key
/// derivation.  `Debug` output redacts the secret and identifiers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub uuid: String,
    pub local_key: String,
    pub device_id: String,
    pub category: String,
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
}

impl DeviceCredentials {
    /// Returns the names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("uuid", &self.uuid),
            ("local_key", &self.local_key),
            ("device_id", &self.device_id),
            ("category", &self.category),
            ("product_id", &self.product_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("uuid", &"<redacted>")
            .field("local_key", &"<redacted>")
            .field("device_id", &"<redacted>")
            .field("category", &self.category)
            .field("product_id", &self.product_id)
            .field("device_name", &self.device_name)
            .field("product_model", &self.product_model)
            .field("product_name", &self.product_name)
            .finish()
    }
}

/// Resolves a device address to its credentials.
///
/// Implementations may look the address up locally or fetch it from a
/// remote directory.  `Ok(None)` means the device is unknown.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn credentials(
        &self,
        address: &str,
        force_update: bool,
    ) -> Result<Option<DeviceCredentials>, String>;
}
