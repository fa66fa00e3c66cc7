//! Byte buffers as lowercase hex strings.

use serde::{de::Error, Deserialize, Deserializer, Serializer};

pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&hex::encode(value))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    hex::decode(s.trim()).map_err(|e| D::Error::custom(format_args!("bad hex bytes: {e}")))
}
