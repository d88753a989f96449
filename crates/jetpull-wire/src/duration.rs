// Durations travel as signed integer nanoseconds; negative values clamp to zero.
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub(crate) fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

fn to_nanos(value: &Duration) -> i64 {
    i64::try_from(value.as_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}

pub(crate) mod nanos {
    use super::*;

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(to_nanos(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(from_nanos(i64::deserialize(deserializer)?))
    }
}

pub(crate) mod nanos_vec {
    use super::*;
    use serde::ser::SerializeSeq;

    pub fn serialize<S>(values: &[Duration], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&to_nanos(value))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<i64>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(from_nanos).collect())
    }
}
