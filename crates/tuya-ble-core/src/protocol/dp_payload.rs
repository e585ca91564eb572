//! Payloads of the datapoint-carrying frames.
//!
//! Every datapoint is encoded as `[id:1][type:1][len:1][value:len]`.  The
//! four inbound variants add different prefixes in front of that list:
//!
//! | Code                  | Prefix                                   | Ack payload                |
//! |-----------------------|------------------------------------------|----------------------------|
//! | `ReceiveDp`           | none                                     | empty                      |
//! | `ReceiveTimeDp`       | timestamp                                | empty                      |
//! | `ReceiveSignDp`       | `dp_seq:2` `flags:1`                     | `dp_seq:2 flags:1 0x00`    |
//! | `ReceiveSignTimeDp`   | `dp_seq:2` `flags:1` timestamp           | `dp_seq:2 flags:1 0x00`    |
//!
//! A timestamp is a type byte followed by either 13 ASCII digits of
//! milliseconds (type 0) or 4 big-endian bytes of seconds (type 1).

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::domain::datapoint::{Datapoint, DatapointType, DatapointValue};
use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::Code;

const ASCII_MILLIS_LEN: usize = 13;
const DATAPOINT_HEADER_LEN: usize = 3;

/// The decoded content of one inbound datapoint frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDatapoints {
    pub timestamp: DateTime<Utc>,
    pub flags: u8,
    pub updates: Vec<(u8, DatapointValue)>,
    /// Payload to send back in the acknowledgement frame.
    pub ack_payload: Vec<u8>,
}

/// Decodes the payload of a datapoint-carrying frame.
///
/// `received_at` stamps frames that do not carry their own timestamp.
/// Returns `Ok(None)` if `code` is not a datapoint-carrying code.
///
/// # Errors
///
/// Returns [`ProtocolError::Length`] or [`ProtocolError::Format`] for a
/// truncated or malformed payload and [`ProtocolError::Datapoint`] for an
/// undecodable value.
pub fn parse_inbound(
    code: Code,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Option<InboundDatapoints>, ProtocolError> {
    let (timestamp, flags, start, ack_payload) = match code {
        Code::ReceiveDp => (received_at, 0, 0, Vec::new()),
        Code::ReceiveTimeDp => {
            let (ts, pos) = parse_timestamp(payload, 0)?;
            (ts, 0, pos, Vec::new())
        }
        Code::ReceiveSignDp => {
            let (dp_seq, flags) = parse_sign_prefix(payload)?;
            (received_at, flags, 3, sign_ack(dp_seq, flags))
        }
        Code::ReceiveSignTimeDp => {
            let (dp_seq, flags) = parse_sign_prefix(payload)?;
            let (ts, pos) = parse_timestamp(payload, 3)?;
            (ts, flags, pos, sign_ack(dp_seq, flags))
        }
        _ => return Ok(None),
    };
    let updates = parse_datapoints(payload, start)?;
    Ok(Some(InboundDatapoints {
        timestamp,
        flags,
        updates,
        ack_payload,
    }))
}

fn parse_sign_prefix(payload: &[u8]) -> Result<(u16, u8), ProtocolError> {
    if payload.len() < 3 {
        return Err(ProtocolError::Length {
            declared: 3,
            available: payload.len(),
        });
    }
    Ok((u16::from_be_bytes([payload[0], payload[1]]), payload[2]))
}

fn sign_ack(dp_seq: u16, flags: u8) -> Vec<u8> {
    let mut ack = dp_seq.to_be_bytes().to_vec();
    ack.push(flags);
    ack.push(0);
    ack
}

/// Reads a timestamp at `pos`, returning it and the offset after it.
///
/// # Errors
///
/// Returns [`ProtocolError::Length`] if the data ends early and
/// [`ProtocolError::Format`] for an unknown type byte or non-numeric digits.
pub fn parse_timestamp(data: &[u8], pos: usize) -> Result<(DateTime<Utc>, usize), ProtocolError> {
    let kind = *data.get(pos).ok_or(ProtocolError::Length {
        declared: pos + 1,
        available: data.len(),
    })?;
    let start = pos + 1;
    let (timestamp, end) = match kind {
        0 => {
            let end = start + ASCII_MILLIS_LEN;
            let digits = data.get(start..end).ok_or(ProtocolError::Length {
                declared: end,
                available: data.len(),
            })?;
            let millis: i64 = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::Format("timestamp digits are not numeric".into()))?;
            let ts = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| ProtocolError::Format(format!("timestamp {millis} out of range")))?;
            (ts, end)
        }
        1 => {
            let end = start + 4;
            let bytes = data.get(start..end).ok_or(ProtocolError::Length {
                declared: end,
                available: data.len(),
            })?;
            let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let ts = Utc
                .timestamp_opt(i64::from(secs), 0)
                .single()
                .ok_or_else(|| ProtocolError::Format(format!("timestamp {secs} out of range")))?;
            (ts, end)
        }
        other => {
            return Err(ProtocolError::Format(format!(
                "unknown timestamp type {other}"
            )))
        }
    };
    debug!("received timestamp {timestamp}");
    Ok((timestamp, end))
}

/// Decodes the datapoint list starting at `pos`.
///
/// Parsing continues while a full datapoint header remains; trailing bytes
/// shorter than a header are ignored.
///
/// # Errors
///
/// Returns [`ProtocolError::Length`] if a value runs past the end of the
/// payload and [`ProtocolError::Datapoint`] for unknown types or bad values.
pub fn parse_datapoints(
    data: &[u8],
    mut pos: usize,
) -> Result<Vec<(u8, DatapointValue)>, ProtocolError> {
    let mut updates = Vec::new();
    while data.len().saturating_sub(pos) >= DATAPOINT_HEADER_LEN {
        let id = data[pos];
        let kind = DatapointType::try_from(data[pos + 1])?;
        let len = usize::from(data[pos + 2]);
        pos += DATAPOINT_HEADER_LEN;
        let end = pos + len;
        let raw = data.get(pos..end).ok_or(ProtocolError::Length {
            declared: end,
            available: data.len(),
        })?;
        let value = DatapointValue::decode(id, kind, raw)?;
        debug!("received datapoint update, id: {id}, type: {kind:?}, value: {value:?}");
        updates.push((id, value));
        pos = end;
    }
    Ok(updates)
}

/// Builds the payload of a `SendDps` frame for protocol version 3.
///
/// # Errors
///
/// Returns [`ProtocolError::Length`] if a value is longer than the one-byte
/// length field allows.
pub fn encode_datapoints(datapoints: &[Datapoint]) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = Vec::new();
    for dp in datapoints {
        let value = dp.value.encode();
        let len = u8::try_from(value.len()).map_err(|_| ProtocolError::Length {
            declared: usize::from(u8::MAX),
            available: value.len(),
        })?;
        debug!(
            "sending datapoint update, id: {}, type: {:?}, value: {:?}",
            dp.id,
            dp.kind(),
            dp.value
        );
        payload.push(dp.id);
        payload.push(dp.kind() as u8);
        payload.push(len);
        payload.extend_from_slice(&value);
    }
    Ok(payload)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
