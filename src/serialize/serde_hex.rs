//! Addresses as `"0x..."` strings, the way `printf("%p")` spells them.
//!
//! Serialization formats on the stack, so it can run inside the tracer's
//! allocation-free flush.

use std::{fmt, fmt::Write};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::util::print::StackWriter;

pub fn serialize<S>(value: &usize, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut buf = StackWriter::<24>::new();
    let _ = write!(buf, "{:#x}", *value);
    // `{:#x}` output is always ASCII
    serializer.serialize_str(std::str::from_utf8(buf.as_bytes()).unwrap_or("0x0"))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> de::Visitor<'de> for V {
        type Value = usize;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a hexadecimal address")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v as usize)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_addr(v).ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }

    deserializer.deserialize_any(V)
}

/// Parse `0x1f`, `0X1F` or glibc's `(nil)`.
pub fn parse_addr(s: &str) -> Option<usize> {
    if s == "(nil)" {
        return Some(0);
    }
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    usize::from_str_radix(digits, 16).ok()
}

/// A bare address that (de)serializes as a hex string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HexAddr(pub usize);

impl Serialize for HexAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for HexAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize(deserializer).map(HexAddr)
    }
}
