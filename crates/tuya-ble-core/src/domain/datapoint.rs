//! Typed datapoints.
//!
//! A datapoint is one numbered unit of device state.  The device tags every
//! value with a one-byte type; here the tag is not stored separately but
//! derived from the [`DatapointValue`] variant, so a datapoint whose tag and
//! value disagree cannot be constructed.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while converting datapoint values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatapointError {
    /// The type tag is outside the known range.
    #[error("unknown datapoint type tag: {0}")]
    UnknownType(u8),

    /// Enum datapoints only hold unsigned values that fit 32 bits.
    #[error("value of an enum datapoint must be an unsigned 32-bit integer, got {0}")]
    EnumValue(i64),

    /// A write tried to change the type of an existing datapoint.
    #[error("datapoint {id} is {expected:?}, cannot assign a {actual:?} value")]
    TypeMismatch {
        id: u8,
        expected: DatapointType,
        actual: DatapointType,
    },

    /// A string datapoint arrived with bytes that are not UTF-8.
    #[error("datapoint {id} carries a string that is not valid UTF-8")]
    InvalidUtf8 { id: u8 },

    /// The encoded value length does not suit the type.
    #[error("datapoint {id} of type {kind:?} has invalid length {len}")]
    InvalidLength { id: u8, kind: DatapointType, len: usize },
}

/// Wire type tag of a datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DatapointType {
    Raw = 0,
    Bool = 1,
    Value = 2,
    String = 3,
    Enum = 4,
    Bitmap = 5,
}

impl TryFrom<u8> for DatapointType {
    type Error = DatapointError;

    fn try_from(value: u8) -> Result<Self, DatapointError> {
        match value {
            0 => Ok(DatapointType::Raw),
            1 => Ok(DatapointType::Bool),
            2 => Ok(DatapointType::Value),
            3 => Ok(DatapointType::String),
            4 => Ok(DatapointType::Enum),
            5 => Ok(DatapointType::Bitmap),
            other => Err(DatapointError::UnknownType(other)),
        }
    }
}

/// A datapoint value in its native representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapointValue {
    Raw(Vec<u8>),
    Bool(bool),
    Value(i32),
    String(String),
    Enum(u32),
    Bitmap(Vec<u8>),
}

impl DatapointValue {
    /// Builds an enum value, rejecting negatives and values wider than 32 bits.
    ///
    /// # Errors
    ///
    /// Returns [`DatapointError::EnumValue`] for out-of-range input.
    pub fn enumeration(value: i64) -> Result<Self, DatapointError> {
        u32::try_from(value)
            .map(DatapointValue::Enum)
            .map_err(|_| DatapointError::EnumValue(value))
    }

    /// The wire type tag for this value.
    pub fn kind(&self) -> DatapointType {
        match self {
            DatapointValue::Raw(_) => DatapointType::Raw,
            DatapointValue::Bool(_) => DatapointType::Bool,
            DatapointValue::Value(_) => DatapointType::Value,
            DatapointValue::String(_) => DatapointType::String,
            DatapointValue::Enum(_) => DatapointType::Enum,
            DatapointValue::Bitmap(_) => DatapointType::Bitmap,
        }
    }

    /// The zero value of `kind`.
    pub fn default_for(kind: DatapointType) -> Self {
        match kind {
            DatapointType::Raw => DatapointValue::Raw(Vec::new()),
            DatapointType::Bool => DatapointValue::Bool(false),
            DatapointType::Value => DatapointValue::Value(0),
            DatapointType::String => DatapointValue::String(String::new()),
            DatapointType::Enum => DatapointValue::Enum(0),
            DatapointType::Bitmap => DatapointValue::Bitmap(Vec::new()),
        }
    }

    /// Encodes the value bytes (without the id/type/length prefix).
    ///
    /// Enums use the narrowest of 1, 2 or 4 bytes that holds the value.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DatapointValue::Raw(b) | DatapointValue::Bitmap(b) => b.clone(),
            DatapointValue::Bool(v) => vec![u8::from(*v)],
            DatapointValue::Value(v) => v.to_be_bytes().to_vec(),
            DatapointValue::String(s) => s.as_bytes().to_vec(),
            DatapointValue::Enum(v) => {
                if *v > 0xFFFF {
                    v.to_be_bytes().to_vec()
                } else if *v > 0xFF {
                    (*v as u16).to_be_bytes().to_vec()
                } else {
                    vec![*v as u8]
                }
            }
        }
    }

    /// Decodes value bytes received for datapoint `id`.
    ///
    /// Integers are big-endian and may be narrower than 4 bytes; signed
    /// values are sign-extended.
    ///
    /// # Errors
    ///
    /// Returns [`DatapointError::InvalidLength`] for integers wider than
    /// 4 bytes and [`DatapointError::InvalidUtf8`] for undecodable strings.
    pub fn decode(id: u8, kind: DatapointType, raw: &[u8]) -> Result<Self, DatapointError> {
        let too_wide = || DatapointError::InvalidLength {
            id,
            kind,
            len: raw.len(),
        };
        match kind {
            DatapointType::Raw => Ok(DatapointValue::Raw(raw.to_vec())),
            DatapointType::Bitmap => Ok(DatapointValue::Bitmap(raw.to_vec())),
            DatapointType::Bool => Ok(DatapointValue::Bool(raw.iter().any(|&b| b != 0))),
            DatapointType::Value => {
                if raw.len() > 4 {
                    return Err(too_wide());
                }
                let negative = raw.first().is_some_and(|b| b & 0x80 != 0);
                let mut bytes = if negative { [0xFF; 4] } else { [0x00; 4] };
                bytes[4 - raw.len()..].copy_from_slice(raw);
                Ok(DatapointValue::Value(i32::from_be_bytes(bytes)))
            }
            DatapointType::Enum => {
                if raw.len() > 4 {
                    return Err(too_wide());
                }
                let mut bytes = [0u8; 4];
                bytes[4 - raw.len()..].copy_from_slice(raw);
                Ok(DatapointValue::Enum(u32::from_be_bytes(bytes)))
            }
            DatapointType::String => String::from_utf8(raw.to_vec())
                .map(DatapointValue::String)
                .map_err(|_| DatapointError::InvalidUtf8 { id }),
        }
    }
}

/// One datapoint as last observed or written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapoint {
    pub id: u8,
    pub timestamp: DateTime<Utc>,
    pub flags: u8,
    pub value: DatapointValue,
    /// Whether the most recent update came from the device and changed the value.
    pub changed_by_device: bool,
}

impl Datapoint {
    pub fn new(id: u8, timestamp: DateTime<Utc>, flags: u8, value: DatapointValue) -> Self {
        Self {
            id,
            timestamp,
            flags,
            value,
            changed_by_device: false,
        }
    }

    pub fn kind(&self) -> DatapointType {
        self.value.kind()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
