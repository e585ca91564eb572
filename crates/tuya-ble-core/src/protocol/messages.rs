//! Message codes, security flags and the fixed-layout handshake payloads.
//!
//! Every frame on the wire carries a 16-bit message code. Codes below
//! `0x8000` are commands the host sends (the device echoes the code in its
//! response); codes at or above `0x8000` are initiated by the device.

use crate::protocol::codec::ProtocolError;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the plaintext frame header: seq(4) + response_to(4) + code(2) + len(2).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Size of the trailing CRC-16 in the plaintext frame.
pub const CRC_SIZE: usize = 2;

/// AES block size; plaintext frames are zero-padded to a multiple of this.
pub const BLOCK_SIZE: usize = 16;

/// Size of the IV carried in cleartext after the security flag.
pub const IV_SIZE: usize = 16;

/// Default maximum GATT write size for one packet.
pub const GATT_MTU: usize = 20;

/// Fixed length of the pairing request payload.
pub const PAIRING_REQUEST_SIZE: usize = 44;

/// Minimum length of the device-info response payload.
pub const DEVICE_INFO_MIN_SIZE: usize = 46;

/// Number of pairing-secret bytes that feed key derivation.
pub const LOCAL_KEY_SIZE: usize = 6;

/// 128-bit UUID of the primary GATT service exposed by Tuya BLE devices.
pub const SERVICE_UUID: &str = "0000a201-0000-1000-8000-00805f9b34fb";

/// Characteristic the host subscribes to for inbound packets.
pub const CHARACTERISTIC_NOTIFY: &str = "00002b10-0000-1000-8000-00805f9b34fb";

/// Characteristic the host writes outbound packets to.
pub const CHARACTERISTIC_WRITE: &str = "00002b11-0000-1000-8000-00805f9b34fb";

/// Bluetooth SIG company identifier used in the manufacturer advertisement data.
pub const MANUFACTURER_DATA_ID: u16 = 0x07D0;

/// Pair response code meaning the device already trusts this host.
pub const PAIR_RESULT_ALREADY_PAIRED: u8 = 2;

// ── Message codes ─────────────────────────────────────────────────────────────

/// All message codes the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Code {
    // Host-initiated commands
    DeviceInfo = 0x0000,
    Pair = 0x0001,
    SendDps = 0x0002,
    DeviceStatus = 0x0003,
    Unbind = 0x0005,
    DeviceReset = 0x0006,
    // Device-initiated frames
    ReceiveDp = 0x8001,
    ReceiveTimeDp = 0x8003,
    ReceiveSignDp = 0x8004,
    ReceiveSignTimeDp = 0x8005,
    ReceiveTime1Request = 0x8011,
    ReceiveTime2Request = 0x8012,
}

impl TryFrom<u16> for Code {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, ()> {
        match value {
            0x0000 => Ok(Code::DeviceInfo),
            0x0001 => Ok(Code::Pair),
            0x0002 => Ok(Code::SendDps),
            0x0003 => Ok(Code::DeviceStatus),
            0x0005 => Ok(Code::Unbind),
            0x0006 => Ok(Code::DeviceReset),
            0x8001 => Ok(Code::ReceiveDp),
            0x8003 => Ok(Code::ReceiveTimeDp),
            0x8004 => Ok(Code::ReceiveSignDp),
            0x8005 => Ok(Code::ReceiveSignTimeDp),
            0x8011 => Ok(Code::ReceiveTime1Request),
            0x8012 => Ok(Code::ReceiveTime2Request),
            _ => Err(()),
        }
    }
}

impl Code {
    /// The security flag an outbound frame with this code is encrypted under.
    ///
    /// Only the device-info request uses the login key: it is the one
    /// exchange that happens before the session key exists.
    pub fn outbound_security_flag(self) -> SecurityFlag {
        match self {
            Code::DeviceInfo => SecurityFlag::Login,
            _ => SecurityFlag::Session,
        }
    }
}

// ── Security flags ────────────────────────────────────────────────────────────

/// Cleartext tag at the start of every envelope selecting the decryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityFlag {
    /// Authentication key issued by the device in its device-info response.
    Auth = 0x01,
    /// Key derived from the pairing secret alone.
    Login = 0x04,
    /// Key derived from the pairing secret and the device-supplied salt.
    Session = 0x05,
}

impl TryFrom<u8> for SecurityFlag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(SecurityFlag::Auth),
            0x04 => Ok(SecurityFlag::Login),
            0x05 => Ok(SecurityFlag::Session),
            other => Err(ProtocolError::UnknownSecurityFlag(other)),
        }
    }
}

// ── Handshake payloads ────────────────────────────────────────────────────────

/// Parsed device-info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_version: (u8, u8),
    pub protocol_version: (u8, u8),
    pub hardware_version: (u8, u8),
    pub flags: u8,
    pub is_bound: bool,
    pub salt: [u8; 6],
    pub auth_key: [u8; 32],
}

impl DeviceInfo {
    /// Parses the device-info response payload.
    ///
    /// Layout:
    /// ```text
    /// [dev_ver:2][proto_ver:2][flags:1][bound:1][salt:6][hw_ver:2][auth_key:32]
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Length`] if the payload is shorter than 46 bytes.
    pub fn parse(p: &[u8]) -> Result<Self, ProtocolError> {
        if p.len() < DEVICE_INFO_MIN_SIZE {
            return Err(ProtocolError::Length {
                declared: DEVICE_INFO_MIN_SIZE,
                available: p.len(),
            });
        }
        let mut salt = [0u8; 6];
        salt.copy_from_slice(&p[6..12]);
        let mut auth_key = [0u8; 32];
        auth_key.copy_from_slice(&p[14..46]);
        Ok(Self {
            device_version: (p[0], p[1]),
            protocol_version: (p[2], p[3]),
            hardware_version: (p[12], p[13]),
            flags: p[4],
            is_bound: p[5] != 0,
            salt,
            auth_key,
        })
    }

    /// Serialises the response the way a device lays it out.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEVICE_INFO_MIN_SIZE);
        buf.push(self.device_version.0);
        buf.push(self.device_version.1);
        buf.push(self.protocol_version.0);
        buf.push(self.protocol_version.1);
        buf.push(self.flags);
        buf.push(u8::from(self.is_bound));
        buf.extend_from_slice(&self.salt);
        buf.push(self.hardware_version.0);
        buf.push(self.hardware_version.1);
        buf.extend_from_slice(&self.auth_key);
        buf
    }
}

/// Renders a `(major, minor)` pair as `"major.minor"`.
pub fn format_version(version: (u8, u8)) -> String {
    format!("{}.{}", version.0, version.1)
}

/// Builds the 44-byte pairing request: uuid ++ local key ++ device id, zero-padded.
///
/// Input longer than the fixed layout is truncated.
pub fn build_pairing_request(uuid: &str, local_key: &[u8], device_id: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PAIRING_REQUEST_SIZE);
    buf.extend_from_slice(uuid.as_bytes());
    buf.extend_from_slice(local_key);
    buf.extend_from_slice(device_id.as_bytes());
    buf.resize(PAIRING_REQUEST_SIZE, 0x00);
    buf
}

/// Interprets a pair response code: "already paired" counts as success.
pub fn normalize_pair_result(code: u8) -> u8 {
    if code == PAIR_RESULT_ALREADY_PAIRED {
        0
    } else {
        code
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> DeviceInfo {
        DeviceInfo {
            device_version: (2, 0),
            protocol_version: (3, 0),
            hardware_version: (1, 0),
            flags: 0,
            is_bound: true,
            salt: [1, 2, 3, 4, 5, 6],
            auth_key: [0xAA; 32],
        }
    }

    #[test]
    fn test_code_try_from_known_values() {
        assert_eq!(Code::try_from(0x0000), Ok(Code::DeviceInfo));
        assert_eq!(Code::try_from(0x8012), Ok(Code::ReceiveTime2Request));
    }

    #[test]
    fn test_code_try_from_unknown_value_fails() {
        assert_eq!(Code::try_from(0x0004), Err(()));
        assert_eq!(Code::try_from(0xFFFF), Err(()));
    }

    #[test]
    fn test_only_device_info_uses_login_key() {
        assert_eq!(Code::DeviceInfo.outbound_security_flag(), SecurityFlag::Login);
        assert_eq!(Code::Pair.outbound_security_flag(), SecurityFlag::Session);
        assert_eq!(Code::SendDps.outbound_security_flag(), SecurityFlag::Session);
        assert_eq!(
            Code::ReceiveDp.outbound_security_flag(),
            SecurityFlag::Session
        );
    }

    #[test]
    fn test_security_flag_rejects_unknown_value() {
        assert!(matches!(
            SecurityFlag::try_from(0x02),
            Err(ProtocolError::UnknownSecurityFlag(0x02))
        ));
    }

    #[test]
    fn test_device_info_parses_reference_layout() {
        // Arrange
        let bytes = sample_info().to_bytes();

        // Act
        let info = DeviceInfo::parse(&bytes).unwrap();

        // Assert
        assert_eq!(info, sample_info());
        assert_eq!(format_version(info.protocol_version), "3.0");
        assert_eq!(format_version(info.hardware_version), "1.0");
    }

    #[test]
    fn test_device_info_accepts_trailing_bytes() {
        let mut bytes = sample_info().to_bytes();
        bytes.extend_from_slice(&[0xFF; 4]);
        assert!(DeviceInfo::parse(&bytes).is_ok());
    }

    #[test]
    fn test_device_info_too_short_is_length_error() {
        let bytes = vec![0u8; 45];
        assert!(matches!(
            DeviceInfo::parse(&bytes),
            Err(ProtocolError::Length {
                declared: 46,
                available: 45
            })
        ));
    }

    #[test]
    fn test_pairing_request_is_zero_padded_to_44_bytes() {
        // Arrange / Act
        let req = build_pairing_request("uuid1234", b"abcdef", "dev42");

        // Assert
        assert_eq!(req.len(), PAIRING_REQUEST_SIZE);
        assert_eq!(&req[..8], b"uuid1234");
        assert_eq!(&req[8..14], b"abcdef");
        assert_eq!(&req[14..19], b"dev42");
        assert!(req[19..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_already_paired_counts_as_success() {
        assert_eq!(normalize_pair_result(0), 0);
        assert_eq!(normalize_pair_result(PAIR_RESULT_ALREADY_PAIRED), 0);
        assert_eq!(normalize_pair_result(1), 1);
    }
}
