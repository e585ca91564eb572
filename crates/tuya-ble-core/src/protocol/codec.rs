//! Binary codec for Tuya BLE frames.
//!
//! Plaintext frame:
//! ```text
//! [seq:4][response_to:4][code:2][payload_len:2][payload:N][crc16:2][zero pad to 16]
//! ```
//! All multi-byte integers are big-endian.  The CRC is CRC-16/ARC
//! (reflected polynomial 0xA001, initial value 0xFFFF) over header + payload.
//!
//! Envelope (what actually goes to the fragmenter):
//! ```text
//! [security_flag:1][iv:16][AES-CBC(plaintext frame)]
//! ```

use thiserror::Error;

use crate::crypto::{decrypt_cbc, encrypt_cbc, random_iv, SessionKeys};
use crate::domain::datapoint::DatapointError;
use crate::protocol::messages::{
    Code, SecurityFlag, BLOCK_SIZE, CRC_SIZE, FRAME_HEADER_SIZE, IV_SIZE,
};

/// Errors that can occur while building or parsing frames and packets.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// Structure does not follow the wire format (bad varint, bad type tag, …).
    #[error("malformed data: {0}")]
    Format(String),

    /// The trailing CRC does not match the recomputed one.
    #[error("CRC mismatch: frame carries 0x{actual:04X}, computed 0x{expected:04X}")]
    Crc { expected: u16, actual: u16 },

    /// Fewer bytes are available than a length field declares.
    #[error("length mismatch: declared {declared} bytes, available {available}")]
    Length { declared: usize, available: usize },

    /// The key selected by a security flag has not been derived yet.
    #[error("key unavailable for security flag {0:?}")]
    KeyUnavailable(SecurityFlag),

    /// The envelope starts with a security flag this engine does not know.
    #[error("unknown security flag: 0x{0:02X}")]
    UnknownSecurityFlag(u8),

    /// The block cipher rejected its input.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// The link MTU cannot hold the first packet's header plus one data byte.
    #[error("MTU {mtu} too small; first packet header alone needs {overhead} bytes")]
    MtuTooSmall { mtu: usize, overhead: usize },

    /// A datapoint inside a frame payload could not be decoded.
    #[error(transparent)]
    Datapoint(#[from] DatapointError),
}

/// One logical protocol message before encryption.
///
/// `code` is kept as the raw wire value so frames with codes this engine does
/// not know can still be parsed, logged and dropped by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub response_to: u32,
    pub code: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(seq: u32, response_to: u32, code: Code, payload: Vec<u8>) -> Self {
        Self {
            seq,
            response_to,
            code: code as u16,
            payload,
        }
    }

    /// The decoded message code, if known.
    pub fn known_code(&self) -> Option<Code> {
        Code::try_from(self.code).ok()
    }
}

// ── CRC ───────────────────────────────────────────────────────────────────────

/// CRC-16/ARC over `data` with initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            let lsb = crc & 1;
            crc >>= 1;
            if lsb != 0 {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

// ── Plaintext frames ──────────────────────────────────────────────────────────

/// Serialises `frame` into its padded plaintext form.
///
/// # Errors
///
/// Returns [`ProtocolError::Length`] if the payload does not fit the 16-bit
/// length field.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let payload_len = u16::try_from(frame.payload.len()).map_err(|_| ProtocolError::Length {
        declared: u16::MAX as usize,
        available: frame.payload.len(),
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + frame.payload.len() + CRC_SIZE + BLOCK_SIZE);
    buf.extend_from_slice(&frame.seq.to_be_bytes());
    buf.extend_from_slice(&frame.response_to.to_be_bytes());
    buf.extend_from_slice(&frame.code.to_be_bytes());
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&frame.payload);

    let crc = crc16(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());

    let padded = buf.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    buf.resize(padded, 0x00);
    Ok(buf)
}

/// Parses a padded plaintext frame and validates its CRC.
///
/// # Errors
///
/// - [`ProtocolError::Length`] if the buffer is shorter than the header, or
///   than header + declared payload + CRC.
/// - [`ProtocolError::Crc`] if the trailing CRC does not match.
pub fn decode_frame(raw: &[u8]) -> Result<Frame, ProtocolError> {
    if raw.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::Length {
            declared: FRAME_HEADER_SIZE,
            available: raw.len(),
        });
    }

    let seq = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let response_to = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let code = u16::from_be_bytes([raw[8], raw[9]]);
    let payload_len = u16::from_be_bytes([raw[10], raw[11]]) as usize;

    let data_end = FRAME_HEADER_SIZE + payload_len;
    if raw.len() < data_end + CRC_SIZE {
        return Err(ProtocolError::Length {
            declared: payload_len,
            available: raw.len().saturating_sub(FRAME_HEADER_SIZE + CRC_SIZE),
        });
    }

    let expected = crc16(&raw[..data_end]);
    let actual = u16::from_be_bytes([raw[data_end], raw[data_end + 1]]);
    if expected != actual {
        return Err(ProtocolError::Crc { expected, actual });
    }

    Ok(Frame {
        seq,
        response_to,
        code,
        payload: raw[FRAME_HEADER_SIZE..data_end].to_vec(),
    })
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// Encrypts `frame` under the key selected by `flag` with a fresh random IV.
///
/// # Errors
///
/// Returns [`ProtocolError::KeyUnavailable`] if `keys` does not hold the key
/// for `flag` yet.
pub fn seal(frame: &Frame, flag: SecurityFlag, keys: &SessionKeys) -> Result<Vec<u8>, ProtocolError> {
    seal_with_iv(frame, flag, keys, &random_iv())
}

/// Like [`seal`] but with a caller-chosen IV.
pub fn seal_with_iv(
    frame: &Frame,
    flag: SecurityFlag,
    keys: &SessionKeys,
    iv: &[u8; IV_SIZE],
) -> Result<Vec<u8>, ProtocolError> {
    let key = keys.key_for(flag)?;
    let plain = encode_frame(frame)?;
    let cipher_text = encrypt_cbc(key, iv, &plain)?;

    let mut envelope = Vec::with_capacity(1 + IV_SIZE + cipher_text.len());
    envelope.push(flag as u8);
    envelope.extend_from_slice(iv);
    envelope.extend_from_slice(&cipher_text);
    Ok(envelope)
}

/// Decrypts and validates an envelope.
///
/// Returns the security flag it was sealed under together with the frame.
///
/// # Errors
///
/// Propagates key lookup, cipher, length and CRC failures.
pub fn open(envelope: &[u8], keys: &SessionKeys) -> Result<(SecurityFlag, Frame), ProtocolError> {
    if envelope.len() < 1 + IV_SIZE {
        return Err(ProtocolError::Length {
            declared: 1 + IV_SIZE,
            available: envelope.len(),
        });
    }
    let flag = SecurityFlag::try_from(envelope[0])?;
    let key = keys.key_for(flag)?;
    let iv = &envelope[1..1 + IV_SIZE];
    let plain = decrypt_cbc(key, iv, &envelope[1 + IV_SIZE..])?;
    let frame = decode_frame(&plain)?;
    Ok((flag, frame))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::DeviceInfo;

    fn paired_keys() -> SessionKeys {
        let mut keys = SessionKeys::from_pairing_secret("0123456789abcdef");
        keys.apply_device_info(&DeviceInfo {
            device_version: (2, 0),
            protocol_version: (3, 0),
            hardware_version: (1, 0),
            flags: 0,
            is_bound: true,
            salt: [9, 8, 7, 6, 5, 4],
            auth_key: [0x5A; 32],
        });
        keys
    }

    #[test]
    fn test_crc16_arc_reference_vector() {
        // CRC-16 with poly 0xA001 and init 0xFFFF is CRC-16/MODBUS; "123456789" → 0x4B37.
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_of_empty_input_is_initial_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_encode_frame_layout_and_padding() {
        // Arrange
        let frame = Frame::new(1, 0, Code::DeviceStatus, vec![]);

        // Act
        let raw = encode_frame(&frame).unwrap();

        // Assert – 12 header + 0 payload + 2 CRC = 14, padded to 16
        assert_eq!(raw.len(), 16);
        assert_eq!(&raw[0..4], &[0, 0, 0, 1]);
        assert_eq!(&raw[4..8], &[0, 0, 0, 0]);
        assert_eq!(&raw[8..10], &[0x00, 0x03]);
        assert_eq!(&raw[10..12], &[0x00, 0x00]);
        assert_eq!(u16::from_be_bytes([raw[12], raw[13]]), crc16(&raw[..12]));
        assert_eq!(&raw[14..], &[0, 0]);
    }

    #[test]
    fn test_encode_frame_exact_block_needs_no_padding() {
        // 12 + 2 + 2 = 16 bytes exactly
        let raw = encode_frame(&Frame::new(5, 4, Code::Pair, vec![0xAB, 0xCD])).unwrap();
        assert_eq!(raw.len(), 16);
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::new(77, 12, Code::SendDps, (0u8..40).collect());
        let raw = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&raw).unwrap(), frame);
    }

    #[test]
    fn test_flipping_header_or_payload_byte_is_crc_error() {
        let frame = Frame::new(3, 1, Code::SendDps, b"datapoint payload".to_vec());
        let raw = encode_frame(&frame).unwrap();
        let crc_end = FRAME_HEADER_SIZE + frame.payload.len() + CRC_SIZE;

        for i in (0..crc_end).filter(|i| !(10..12).contains(i)) {
            let mut corrupted = raw.clone();
            corrupted[i] ^= 0x01;
            assert!(
                matches!(decode_frame(&corrupted), Err(ProtocolError::Crc { .. })),
                "flipping byte {i} must be detected by the CRC"
            );
        }
    }

    #[test]
    fn test_flipping_length_field_is_rejected() {
        let frame = Frame::new(3, 1, Code::SendDps, b"datapoint payload".to_vec());
        let raw = encode_frame(&frame).unwrap();
        for i in 10..12 {
            let mut corrupted = raw.clone();
            corrupted[i] ^= 0x01;
            assert!(decode_frame(&corrupted).is_err());
        }
    }

    #[test]
    fn test_declared_length_beyond_buffer_is_length_error() {
        let mut raw = encode_frame(&Frame::new(1, 0, Code::ReceiveDp, vec![1, 2])).unwrap();
        raw[10] = 0x01; // payload_len = 0x0102
        assert!(matches!(
            decode_frame(&raw),
            Err(ProtocolError::Length { declared: 0x0102, .. })
        ));
    }

    #[test]
    fn test_short_buffer_is_length_error() {
        assert!(matches!(
            decode_frame(&[0u8; 5]),
            Err(ProtocolError::Length { declared: 12, available: 5 })
        ));
    }

    #[test]
    fn test_seal_device_info_uses_login_flag() {
        // Arrange
        let keys = SessionKeys::from_pairing_secret("0123456789abcdef");
        let frame = Frame::new(1, 0, Code::DeviceInfo, vec![]);

        // Act
        let envelope = seal(&frame, Code::DeviceInfo.outbound_security_flag(), &keys).unwrap();

        // Assert
        assert_eq!(envelope[0], 0x04);
        assert_eq!((envelope.len() - 1 - IV_SIZE) % BLOCK_SIZE, 0);
        let (flag, opened) = open(&envelope, &keys).unwrap();
        assert_eq!(flag, SecurityFlag::Login);
        assert_eq!(opened, frame);
    }

    #[test]
    fn test_seal_pairing_before_session_is_key_unavailable() {
        let keys = SessionKeys::from_pairing_secret("0123456789abcdef");
        let frame = Frame::new(2, 0, Code::Pair, vec![0; 44]);
        assert_eq!(
            seal(&frame, Code::Pair.outbound_security_flag(), &keys),
            Err(ProtocolError::KeyUnavailable(SecurityFlag::Session))
        );
    }

    #[test]
    fn test_envelope_round_trip_under_each_flag() {
        let keys = paired_keys();
        for flag in [SecurityFlag::Auth, SecurityFlag::Login, SecurityFlag::Session] {
            let frame = Frame::new(10, 0, Code::ReceiveDp, vec![1, 1, 1, 1]);
            let envelope = seal(&frame, flag, &keys).unwrap();
            assert_eq!(open(&envelope, &keys).unwrap(), (flag, frame));
        }
    }

    #[test]
    fn test_open_rejects_unknown_flag() {
        let keys = paired_keys();
        let mut envelope = seal(&Frame::new(1, 0, Code::Pair, vec![]), SecurityFlag::Session, &keys).unwrap();
        envelope[0] = 0x09;
        assert_eq!(
            open(&envelope, &keys),
            Err(ProtocolError::UnknownSecurityFlag(0x09))
        );
    }

    #[test]
    fn test_open_truncated_envelope_is_length_error() {
        assert!(matches!(
            open(&[0x05, 1, 2, 3], &paired_keys()),
            Err(ProtocolError::Length { .. })
        ));
    }

    #[test]
    fn test_unknown_code_still_parses() {
        let frame = Frame {
            seq: 1,
            response_to: 0,
            code: 0x7777,
            payload: vec![],
        };
        let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(decoded.code, 0x7777);
        assert_eq!(decoded.known_code(), None);
    }
}
