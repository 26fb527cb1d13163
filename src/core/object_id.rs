//! Store identity values.
//!
//! An `ObjectId` is 12 bytes: a 4-byte big-endian creation timestamp
//! (seconds), 5 bytes that are random per process and a 3-byte counter.
//! Externally (JSON, `Display`) it is a 24 character lower-case hex string.
//! On the wire it uses the native extended form `{"$oid": "<hex>"}`.

use super::error::{OdmError, Result};
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Key used by the native wire form.
pub const OID_KEY: &str = "$oid";

const COUNTER_MASK: u32 = 0x00ff_ffff;

lazy_static! {
    static ref PROCESS_UNIQUE: [u8; 5] = {
        let random = uuid::Uuid::new_v4();
        let mut bytes = [0u8; 5];
        bytes.copy_from_slice(&random.as_bytes()[..5]);
        bytes
    };
    static ref COUNTER: AtomicU32 = {
        let random = uuid::Uuid::new_v4();
        let b = random.as_bytes();
        AtomicU32::new(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    };
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generate a fresh id from the current time.
    pub fn new() -> Self {
        let secs = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);
        bytes[9..].copy_from_slice(&counter.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Parse a 24 character hex string.
    pub fn parse_str(s: &str) -> Result<Self> {
        if s.len() != 24 {
            return Err(OdmError::InvalidObjectId(format!(
                "'{}' must be 24 hex characters, got {}",
                s,
                s.len()
            )));
        }

        let mut bytes = [0u8; 12];
        let raw = s.as_bytes();
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = hex_digit(raw[i * 2]);
            let lo = hex_digit(raw[i * 2 + 1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => *byte = (hi << 4) | lo,
                _ => {
                    return Err(OdmError::InvalidObjectId(format!(
                        "'{}' contains non-hex characters",
                        s
                    )));
                }
            }
        }
        Ok(Self(bytes))
    }

    pub fn is_valid(s: &str) -> bool {
        Self::parse_str(s).is_ok()
    }

    pub fn to_hex(&self) -> String {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(24);
        for byte in self.0 {
            out.push(DIGITS[(byte >> 4) as usize] as char);
            out.push(DIGITS[(byte & 0x0f) as usize] as char);
        }
        out
    }

    /// Creation time encoded in the first four bytes.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        Utc.timestamp_opt(secs as i64, 0)
            .single()
            .unwrap_or_default()
    }

    /// Native wire representation.
    pub fn to_native(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(OID_KEY.to_string(), Value::String(self.to_hex()));
        Value::Object(map)
    }

    /// Accepts either the native form or a valid string form.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::parse_str(s),
            Value::Object(map) if map.len() == 1 => match map.get(OID_KEY) {
                Some(Value::String(s)) => Self::parse_str(s),
                _ => Err(OdmError::InvalidObjectId(value.to_string())),
            },
            other => Err(OdmError::InvalidObjectId(other.to_string())),
        }
    }

    /// True if `value` is in the native wire form.
    pub fn is_native(value: &Value) -> bool {
        matches!(value, Value::Object(map) if map.len() == 1 && map.contains_key(OID_KEY))
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = OdmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        id.to_native()
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct ObjectIdVisitor;

impl<'de> Visitor<'de> for ObjectIdVisitor {
    type Value = ObjectId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 24 character hex string or {\"$oid\": <hex>}")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ObjectId, E> {
        ObjectId::parse_str(v).map_err(E::custom)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<ObjectId, A::Error> {
        let mut found = None;
        while let Some(key) = map.next_key::<String>()? {
            if key != OID_KEY || found.is_some() {
                return Err(de::Error::custom(format!("unexpected key '{}' in ObjectId", key)));
            }
            let hex: String = map.next_value()?;
            found = Some(ObjectId::parse_str(&hex).map_err(de::Error::custom)?);
        }
        found.ok_or_else(|| de::Error::missing_field(OID_KEY))
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ObjectIdVisitor)
    }
}
