//! Snowflake ids travel as JSON strings but older payloads and tests may use
//! plain numbers. Both are accepted; strings are always emitted.

use serde::{de, Deserialize, Deserializer, Serializer};

pub type Snowflake = u64;

/// Read a snowflake out of a loosely typed JSON value.
pub fn from_value(value: &serde_json::Value) -> Option<Snowflake> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Str(String),
    Num(u64),
}

fn parse<E: de::Error>(raw: Raw) -> Result<Snowflake, E> {
    match raw {
        Raw::Str(s) => s.parse().map_err(E::custom),
        Raw::Num(n) => Ok(n),
    }
}

/// `#[serde(with = "snowflake::string")]`
pub mod string {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Snowflake, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Snowflake, D::Error> {
        parse(Raw::deserialize(deserializer)?)
    }
}

/// `#[serde(with = "snowflake::option")]`
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        id: &Option<Snowflake>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.collect_str(id),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Snowflake>, D::Error> {
        Option::<Raw>::deserialize(deserializer)?
            .map(parse)
            .transpose()
    }
}

/// `#[serde(with = "snowflake::list")]`
pub mod list {
    use super::*;
    use serde::ser::SerializeSeq;

    pub fn serialize<S: Serializer>(ids: &[Snowflake], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(ids.len()))?;
        for id in ids {
            seq.serialize_element(&id.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Snowflake>, D::Error> {
        Vec::<Raw>::deserialize(deserializer)?
            .into_iter()
            .map(parse)
            .collect()
    }
}
