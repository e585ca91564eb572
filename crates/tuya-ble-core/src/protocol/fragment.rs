//! Splitting envelopes into link-MTU packets and stitching them back together.
//!
//! # Packet layout
//!
//! ```text
//! packet 0:  [index varint][total_len varint][version << 4][data…]
//! packet n:  [index varint][data…]
//! ```
//!
//! Varints are little-endian groups of 7 bits with the high bit set on every
//! byte except the last.  At most four groups are accepted when decoding.
//!
//! # Reassembly rules
//!
//! Packets must arrive with strictly increasing indices starting at 0.  A
//! gap or a step backwards discards the partial buffer; an index 0 arriving
//! mid-stream starts a fresh frame.  The envelope is complete exactly when
//! the accumulated length equals the declared total.

use tracing::{debug, warn};

use crate::protocol::codec::ProtocolError;

const VARINT_MAX_GROUPS: usize = 4;

/// Upper bound on the buffer reserved from a peer-declared frame length.
const MAX_PREALLOCATION: usize = 4096;

/// Appends the varint encoding of `value` to `buf`.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Reads a varint at `offset`, returning the value and the offset after it.
///
/// # Errors
///
/// Returns [`ProtocolError::Format`] if the buffer ends inside the varint or
/// the varint runs longer than four groups.
pub fn read_varint(buf: &[u8], offset: usize) -> Result<(u32, usize), ProtocolError> {
    let mut value: u32 = 0;
    for group in 0..=VARINT_MAX_GROUPS {
        let byte = *buf
            .get(offset + group)
            .ok_or_else(|| ProtocolError::Format("truncated packet varint".to_string()))?;
        if group == VARINT_MAX_GROUPS {
            break;
        }
        value |= u32::from(byte & 0x7F) << (group * 7);
        if byte & 0x80 == 0 {
            return Ok((value, offset + group + 1));
        }
    }
    Err(ProtocolError::Format("packet varint longer than 4 bytes".to_string()))
}

fn varint_len(value: u32) -> usize {
    let mut buf = Vec::with_capacity(5);
    write_varint(&mut buf, value);
    buf.len()
}

/// Splits an envelope into packets no larger than `mtu`.
///
/// # Errors
///
/// Returns [`ProtocolError::MtuTooSmall`] if a packet could not carry at least
/// one data byte after its header.
pub fn split_packets(
    envelope: &[u8],
    protocol_version: u8,
    mtu: usize,
) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let total = u32::try_from(envelope.len()).map_err(|_| ProtocolError::Length {
        declared: u32::MAX as usize,
        available: envelope.len(),
    })?;
    let first_overhead = 1 + varint_len(total) + 1;
    if mtu <= first_overhead {
        return Err(ProtocolError::MtuTooSmall {
            mtu,
            overhead: first_overhead,
        });
    }

    let mut packets = Vec::new();
    let mut pos = 0usize;
    let mut index: u32 = 0;
    while pos < envelope.len() {
        let mut packet = Vec::with_capacity(mtu);
        write_varint(&mut packet, index);
        if index == 0 {
            write_varint(&mut packet, total);
            packet.push(protocol_version << 4);
        }
        if packet.len() >= mtu {
            return Err(ProtocolError::MtuTooSmall {
                mtu,
                overhead: packet.len(),
            });
        }
        let take = (mtu - packet.len()).min(envelope.len() - pos);
        packet.extend_from_slice(&envelope[pos..pos + take]);
        packets.push(packet);
        pos += take;
        index += 1;
    }
    Ok(packets)
}

/// Rebuilds envelopes from a stream of inbound packets.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Option<Vec<u8>>,
    expected_index: u32,
    expected_length: usize,
    protocol_version: Option<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards any partial envelope.
    pub fn reset(&mut self) {
        self.buffer = None;
        self.expected_index = 0;
        self.expected_length = 0;
    }

    /// Whether a partial envelope is being accumulated.
    pub fn in_progress(&self) -> bool {
        self.buffer.is_some()
    }

    /// Protocol major version announced in the most recent first packet.
    pub fn last_protocol_version(&self) -> Option<u8> {
        self.protocol_version
    }

    /// Feeds one packet.
    ///
    /// Returns `Ok(Some(envelope))` when a complete envelope is available,
    /// `Ok(None)` when more packets are needed or the packet was discarded
    /// as out of order.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Format`] for an undecodable packet header and
    /// [`ProtocolError::Length`] if data overruns the declared total.  The
    /// partial buffer is discarded in both cases.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let (index, mut pos) = match read_varint(packet, 0) {
            Ok(v) => v,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        if index < self.expected_index {
            warn!(
                "unexpected packet #{index} while expecting #{}; restarting",
                self.expected_index
            );
            self.reset();
        }

        if index != self.expected_index {
            warn!(
                "missing packet #{} (received #{index}); discarding partial frame",
                self.expected_index
            );
            self.reset();
            return Ok(None);
        }

        if index == 0 {
            let (total, after) = match read_varint(packet, pos) {
                Ok(v) => v,
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            };
            let Some(&version) = packet.get(after) else {
                self.reset();
                return Err(ProtocolError::Format(
                    "first packet is missing its version byte".to_string(),
                ));
            };
            self.protocol_version = Some(version >> 4);
            self.expected_length = total as usize;
            self.buffer = Some(Vec::with_capacity(self.expected_length.min(MAX_PREALLOCATION)));
            pos = after + 1;
        }

        let buffer = self.buffer.get_or_insert_with(Vec::new);
        buffer.extend_from_slice(&packet[pos..]);
        self.expected_index += 1;

        let have = buffer.len();
        if have > self.expected_length {
            let declared = self.expected_length;
            self.reset();
            return Err(ProtocolError::Length {
                declared,
                available: have,
            });
        }
        if have == self.expected_length {
            let envelope = self.buffer.take().unwrap_or_default();
            debug!("reassembled {} byte envelope from {} packets", have, self.expected_index);
            self.reset();
            return Ok(Some(envelope));
        }
        Ok(None)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
