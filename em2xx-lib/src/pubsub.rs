//! Topic/value publish-subscribe types shared by the host broker surface and
//! both on-wire publish encodings.
//!
//! Topics are at most 32 bytes including the NUL terminator. Conventional
//! suffixes: `#` return code, `$` metadata, `?` query echo (stripped on
//! reception), and a `!` leading the final segment of command topics.

use crate::error::EmError;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

/// Maximum topic length in bytes, including the NUL terminator.
pub const TOPIC_LENGTH_MAX: usize = 32;

/// Return-code topic suffix.
pub const TOPIC_SUFFIX_RETURN_CODE: char = '#';

/// Wire tags for [`Value`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ValueType {
    Null = 0x00,
    U32 = 0x08,
    U64 = 0x09,
    I32 = 0x0C,
    I64 = 0x0D,
    F32 = 0x10,
    F64 = 0x11,
    Str = 0x20,
    Json = 0x21,
    Bin = 0x30,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// A typed publish/subscribe value.
///
/// Scalars travel as 8 little-endian bytes; strings and JSON are
/// NUL-terminated; binary payloads run to the end of the (exact) payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Json(String),
    Bin(Bytes),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::U32(_) => ValueType::U32,
            Value::U64(_) => ValueType::U64,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Str(_) => ValueType::Str,
            Value::Json(_) => ValueType::Json,
            Value::Bin(_) => ValueType::Bin,
        }
    }

    /// Encode the value's wire bytes (without topic or type tag).
    pub fn encode(&self) -> Bytes {
        fn scalar(v: u64) -> Bytes {
            Bytes::copy_from_slice(&v.to_le_bytes())
        }
        match self {
            Value::Null => Bytes::new(),
            Value::U32(v) => scalar(*v as u64),
            Value::U64(v) => scalar(*v),
            Value::I32(v) => scalar(*v as u32 as u64),
            Value::I64(v) => scalar(*v as u64),
            Value::F32(v) => scalar(v.to_bits() as u64),
            Value::F64(v) => scalar(v.to_bits()),
            Value::Str(s) | Value::Json(s) => {
                let mut b = BytesMut::with_capacity(s.len() + 1);
                b.put_slice(s.as_bytes());
                b.put_u8(0);
                b.freeze()
            }
            Value::Bin(b) => b.clone(),
        }
    }

    /// Decode a value of `vtype` from its wire bytes.
    pub fn decode(vtype: ValueType, data: &[u8]) -> Result<Value, EmError> {
        fn need(data: &[u8], n: usize) -> Result<(), EmError> {
            if data.len() < n {
                Err(EmError::ParameterInvalid(format!(
                    "value payload too short: {} < {}",
                    data.len(),
                    n
                )))
            } else {
                Ok(())
            }
        }
        Ok(match vtype {
            ValueType::Null => Value::Null,
            ValueType::U32 => {
                need(data, 4)?;
                Value::U32(u32::from_le_bytes(data[..4].try_into().unwrap()))
            }
            ValueType::U64 => {
                need(data, 8)?;
                Value::U64(u64::from_le_bytes(data[..8].try_into().unwrap()))
            }
            ValueType::I32 => {
                need(data, 4)?;
                Value::I32(i32::from_le_bytes(data[..4].try_into().unwrap()))
            }
            ValueType::I64 => {
                need(data, 8)?;
                Value::I64(i64::from_le_bytes(data[..8].try_into().unwrap()))
            }
            ValueType::F32 => {
                need(data, 4)?;
                Value::F32(f32::from_le_bytes(data[..4].try_into().unwrap()))
            }
            ValueType::F64 => {
                need(data, 8)?;
                Value::F64(f64::from_le_bytes(data[..8].try_into().unwrap()))
            }
            ValueType::Str | ValueType::Json => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let s = String::from_utf8_lossy(&data[..end]).into_owned();
                if vtype == ValueType::Str {
                    Value::Str(s)
                } else {
                    Value::Json(s)
                }
            }
            ValueType::Bin => Value::Bin(Bytes::copy_from_slice(data)),
            ValueType::Unknown(t) => {
                return Err(EmError::ParameterInvalid(format!("unknown value type 0x{:02x}", t)));
            }
        })
    }

    /// Coerce to u32 where the representation allows.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            Value::U64(v) => u32::try_from(*v).ok(),
            Value::I32(v) => u32::try_from(*v).ok(),
            Value::I64(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Coerce to bool: numeric non-zero, or the usual string spellings.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Null => Some(false),
            Value::U32(v) => Some(*v != 0),
            Value::U64(v) => Some(*v != 0),
            Value::I32(v) => Some(*v != 0),
            Value::I64(v) => Some(*v != 0),
            Value::Str(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// The value as raw bytes, for binary-ish payloads (ping, firmware data).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(b) => Some(b.as_ref()),
            Value::Str(s) | Value::Json(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// A topic/value message as it travels on the application-facing queues.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub value: Value,
}

impl Message {
    pub fn new(topic: impl Into<String>, value: Value) -> Self {
        Self {
            topic: topic.into(),
            value,
        }
    }
}

/// Strip `prefix` plus the separating `/` from `topic`.
///
/// Returns `None` when the topic does not belong to the prefix.
pub fn strip_prefix<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    topic.strip_prefix(prefix)?.strip_prefix('/')
}

/// Encode a publish payload for a framed-device pubsub frame.
///
/// Payload: 32-byte NUL-padded topic followed by the value bytes. The
/// returned metadata carries the value type tag in bits [7:0] and the low
/// two bits of the exact payload length in bits [9:8]; the frame length
/// field only resolves the payload to a word boundary.
pub fn encode_publish(topic: &str, value: &Value) -> Result<(Bytes, u16), EmError> {
    let topic_bytes = topic.as_bytes();
    if topic_bytes.len() >= TOPIC_LENGTH_MAX {
        return Err(EmError::ParameterInvalid(format!("topic too long: {}", topic)));
    }
    let data = value.encode();
    let mut payload = BytesMut::with_capacity(TOPIC_LENGTH_MAX + data.len());
    payload.put_slice(topic_bytes);
    for _ in topic_bytes.len()..TOPIC_LENGTH_MAX {
        payload.put_u8(0);
    }
    payload.put_slice(&data);
    let total = payload.len();
    let metadata = (u8::from(value.value_type()) as u16) | (((total & 3) as u16) << 8);
    Ok((payload.freeze(), metadata))
}

/// Decode a framed-device pubsub payload.
///
/// `payload` is word-aligned as delivered by the frame codec; the exact
/// length is recovered from the size bits in `metadata`.
pub fn decode_publish(payload: &[u8], metadata: u16) -> Result<(String, Value), EmError> {
    let size_lsb = ((metadata >> 8) & 3) as usize;
    let pad = (4 - size_lsb) & 3;
    if payload.len() < TOPIC_LENGTH_MAX + pad {
        return Err(EmError::ParameterInvalid(format!(
            "pubsub payload too short: {}",
            payload.len()
        )));
    }
    let exact = payload.len() - pad;
    let topic = topic_from_bytes(&payload[..TOPIC_LENGTH_MAX]);
    let vtype = ValueType::from_primitive((metadata & 0xFF) as u8);
    let value = Value::decode(vtype, &payload[TOPIC_LENGTH_MAX..exact])?;
    Ok((topic, value))
}

/// Encode a publish payload for the older device's pubsub port.
///
/// Layout: 32-byte NUL-padded topic, then `{type, flags, op, app}`, then the
/// value bytes. The stream frame header carries the exact byte length, so no
/// metadata trick is needed.
pub fn encode_port_publish(topic: &str, value: &Value) -> Result<Bytes, EmError> {
    let topic_bytes = topic.as_bytes();
    if topic_bytes.len() >= TOPIC_LENGTH_MAX {
        return Err(EmError::ParameterInvalid(format!("topic too long: {}", topic)));
    }
    let data = value.encode();
    let mut payload = BytesMut::with_capacity(TOPIC_LENGTH_MAX + 4 + data.len());
    payload.put_slice(topic_bytes);
    for _ in topic_bytes.len()..TOPIC_LENGTH_MAX {
        payload.put_u8(0);
    }
    payload.put_u8(u8::from(value.value_type()));
    payload.put_u8(0); // flags
    payload.put_u8(0); // op
    payload.put_u8(0); // app
    payload.put_slice(&data);
    Ok(payload.freeze())
}

/// Decode an older-device pubsub port payload.
pub fn decode_port_publish(payload: &[u8]) -> Result<(String, Value), EmError> {
    if payload.len() < TOPIC_LENGTH_MAX + 4 {
        return Err(EmError::ParameterInvalid(format!(
            "pubsub port payload too short: {}",
            payload.len()
        )));
    }
    let topic = topic_from_bytes(&payload[..TOPIC_LENGTH_MAX]);
    let vtype = ValueType::from_primitive(payload[TOPIC_LENGTH_MAX]);
    let value = Value::decode(vtype, &payload[TOPIC_LENGTH_MAX + 4..])?;
    Ok((topic, value))
}

fn topic_from_bytes(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
