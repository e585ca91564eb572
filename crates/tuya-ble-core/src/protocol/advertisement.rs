//! Decoding of the pre-connection advertisement.
//!
//! Two advertisement fields matter:
//!
//! - service data under [`SERVICE_UUID`]: when the first byte is `0`, the
//!   rest is the raw product id;
//! - manufacturer data under [`MANUFACTURER_DATA_ID`] (longer than 6 bytes):
//!   bit 7 of byte 0 is the bound flag, byte 1 the protocol version and
//!   bytes 6.. the device uuid encrypted with AES-128-CBC where both key and
//!   IV are `MD5(product id)`.

use std::collections::HashMap;

use tracing::debug;

use crate::crypto::{decrypt_cbc, md5_digest, KeyMaterial};
use crate::protocol::messages::{MANUFACTURER_DATA_ID, SERVICE_UUID};

const MANUFACTURER_UUID_OFFSET: usize = 6;
const SERVICE_DATA_PRODUCT_ID: u8 = 0;

/// Raw advertisement fields as reported by the host BLE stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// Service data keyed by lowercase 128-bit service UUID string.
    pub service_data: HashMap<String, Vec<u8>>,
    /// Manufacturer data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
}

/// What the advertisement tells about the device before connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisedInfo {
    pub product_id: Option<Vec<u8>>,
    pub is_bound: Option<bool>,
    pub protocol_version: Option<u8>,
    pub uuid: Option<String>,
}

impl AdvertisementData {
    /// Extracts bound flag, protocol version and uuid.
    ///
    /// Fields that are absent or cannot be decoded stay `None`.
    pub fn decode(&self) -> AdvertisedInfo {
        let mut info = AdvertisedInfo::default();

        if let Some(data) = self.service_data.get(SERVICE_UUID) {
            if data.len() > 1 && data[0] == SERVICE_DATA_PRODUCT_ID {
                info.product_id = Some(data[1..].to_vec());
            }
        }

        let Some(data) = self.manufacturer_data.get(&MANUFACTURER_DATA_ID) else {
            return info;
        };
        if data.len() <= MANUFACTURER_UUID_OFFSET {
            return info;
        }
        info.is_bound = Some(data[0] & 0x80 != 0);
        info.protocol_version = Some(data[1]);

        if let Some(product_id) = &info.product_id {
            let digest = md5_digest(product_id);
            let key = KeyMaterial::Aes128(digest);
            match decrypt_cbc(&key, &digest, &data[MANUFACTURER_UUID_OFFSET..]) {
                Ok(plain) => match String::from_utf8(plain) {
                    Ok(uuid) => info.uuid = Some(uuid),
                    Err(_) => debug!("advertised uuid is not valid UTF-8"),
                },
                Err(e) => debug!("advertised uuid could not be decrypted: {e}"),
            }
        }
        info
    }
}
