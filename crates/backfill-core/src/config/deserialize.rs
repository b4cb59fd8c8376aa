use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use super::defaults::parse_human_duration;

pub(super) const STRICT_STRING_ERROR: &str = "string value must be quoted";

/// A YAML scalar, remembering whether it was written as a string.
///
/// Names (pools, images, clusters) must be strings so that a pool called
/// `123` or an image called `yes` is written quoted; client options and
/// durations accept any scalar.
enum Scalar {
    Text(String),
    Bare(String),
}

impl Scalar {
    fn strict<E: de::Error>(self) -> Result<String, E> {
        match self {
            Scalar::Text(s) => Ok(s),
            Scalar::Bare(_) => Err(E::custom(STRICT_STRING_ERROR)),
        }
    }

    fn into_string(self) -> String {
        match self {
            Scalar::Text(s) | Scalar::Bare(s) => s,
        }
    }
}

struct ScalarVisitor;

impl Visitor<'_> for ScalarVisitor {
    type Value = Scalar;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string, number or boolean")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
        Ok(Scalar::Text(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Scalar, E> {
        Ok(Scalar::Text(v))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
        Ok(Scalar::Bare(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
        Ok(Scalar::Bare(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
        Ok(Scalar::Bare(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
        Ok(Scalar::Bare(v.to_string()))
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }
}

pub(super) fn deserialize_strict_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Scalar::deserialize(d)?.strict()
}

pub(super) fn deserialize_optional_strict_string<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<String>, D::Error> {
    Option::<Scalar>::deserialize(d)?.map(Scalar::strict).transpose()
}

pub(super) fn deserialize_vec_strict_string<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Vec<String>, D::Error> {
    Vec::<Scalar>::deserialize(d)?
        .into_iter()
        .map(Scalar::strict)
        .collect()
}

/// Client options: `30` and `"30"` mean the same thing.
pub(super) fn deserialize_scalar_map<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    Ok(BTreeMap::<String, Scalar>::deserialize(d)?
        .into_iter()
        .map(|(k, v)| (k, v.into_string()))
        .collect())
}

/// `"45s"`, `"5m"`, or a bare integer number of seconds.
pub(super) fn deserialize_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = Scalar::deserialize(d)?.into_string();
    parse_human_duration(&raw).map_err(de::Error::custom)
}
