//! Addresses as `0x`-prefixed hex strings. Deserialization also accepts plain
//! integers, so hand-written snapshot files can use either.

use std::fmt;

use serde::{de::Visitor, Deserializer, Serializer};

pub trait AsAddr: Copy {
    fn as_addr(self) -> u64;
}

pub trait FromAddr: Copy {
    fn from_addr(value: u64) -> Self;
}

impl AsAddr for u64 {
    fn as_addr(self) -> u64 {
        self
    }
}

impl FromAddr for u64 {
    fn from_addr(value: u64) -> Self {
        value
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Copy + AsAddr,
{
    serializer.collect_str(&format_args!("{:#x}", (*value).as_addr()))
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromAddr,
{
    deserializer.deserialize_any(AddrVisitor::<T>(std::marker::PhantomData))
}

struct AddrVisitor<T>(std::marker::PhantomData<T>);

impl<'de, T> Visitor<'de> for AddrVisitor<T>
where
    T: FromAddr,
{
    type Value = T;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an address, either an integer or a 0x-prefixed hex string")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(T::from_addr(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        parse_addr(v)
            .map(T::from_addr)
            .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(v), &self))
    }
}

/// Parse `0x1000`, `0X1000` or `4096`.
pub fn parse_addr(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => s.parse().ok(),
    }
}

/// Same as the parent module, for `Option<u64>` fields.
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(addr) => serializer.collect_str(&format_args!("{addr:#x}")),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] u64);

        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(addr)| addr))
    }
}

#[cfg(test)]
mod tests {
    use super::parse_addr;

    #[test]
    fn parse_addr_accepts_hex_and_decimal() {
        assert_eq!(parse_addr("0x1000"), Some(0x1000));
        assert_eq!(parse_addr("0X7fff_0000"), Some(0x7fff_0000));
        assert_eq!(parse_addr("4096"), Some(4096));
        assert_eq!(parse_addr("0xzz"), None);
    }
}
