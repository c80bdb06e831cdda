//! Base64 encoding for byte payloads inside the JSON envelope.
//!
//! The designed path ships image bytes as a multipart file part and keeps
//! the JSON envelope metadata-only, but `data` may still appear inline;
//! when it does it travels as a standard base64 string. Absent and `null`
//! values both decode to an empty buffer.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) if !s.is_empty() => STANDARD.decode(&s).map_err(serde::de::Error::custom),
        _ => Ok(Vec::new()),
    }
}
