//! JSON encoding for floats that may be NaN or infinite.
//!
//! `serde_json` writes non-finite floats as `null` and cannot read them back
//! into `f64`. Contrast curves legitimately contain NaN (undefined
//! separations) and infinity (zero throughput), so artifacts store those
//! values as the strings `"NaN"`, `"inf"` and `"-inf"`.
//!
//! Use with `#[serde(with = "crate::serde_float::scalar")]` or
//! `#[serde(with = "crate::serde_float::vec")]`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum JsonFloat {
    Finite(f64),
    Special(String),
}

impl From<f64> for JsonFloat {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            JsonFloat::Finite(value)
        } else if value.is_nan() {
            JsonFloat::Special("NaN".to_string())
        } else if value > 0.0 {
            JsonFloat::Special("inf".to_string())
        } else {
            JsonFloat::Special("-inf".to_string())
        }
    }
}

impl JsonFloat {
    fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            JsonFloat::Finite(value) => Ok(value),
            JsonFloat::Special(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("unrecognized float literal {other:?}"))),
            },
        }
    }
}

pub mod scalar {
    use super::*;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        JsonFloat::from(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        JsonFloat::deserialize(deserializer)?.into_f64::<D::Error>()
    }
}

pub mod vec {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<JsonFloat> = values.iter().map(|v| JsonFloat::from(*v)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<JsonFloat>::deserialize(deserializer)?
            .into_iter()
            .map(|v| v.into_f64::<D::Error>())
            .collect()
    }
}
