use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(#[serde(with = "double_repr")] f64),
    Timestamp(Timestamp),
    /// Local placeholder for a server timestamp that has not been committed yet.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous_value: Option<Box<FirestoreValue>>,
    },
    String(String),
    Bytes(BytesValue),
    /// Document path relative to the database root.
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn server_timestamp_placeholder(
        local_write_time: Timestamp,
        previous_value: Option<FirestoreValue>,
    ) -> Self {
        // Chained placeholders keep the value that preceded the first one.
        let previous_value = match previous_value {
            Some(FirestoreValue {
                kind:
                    ValueKind::ServerTimestamp {
                        previous_value: earlier,
                        ..
                    },
            }) => earlier,
            other => other.map(Box::new),
        };
        Self {
            kind: ValueKind::ServerTimestamp {
                local_write_time,
                previous_value,
            },
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        FirestoreValue::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        FirestoreValue::from_double(value)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        FirestoreValue::from_bool(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        FirestoreValue::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        FirestoreValue::from_string(value)
    }
}

/// JSON has no representation for non-finite doubles; those are written as strings.
mod double_repr {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() && value.is_sign_positive() {
            serializer.serialize_str("Infinity")
        } else if value.is_infinite() {
            serializer.serialize_str("-Infinity")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid double value {other}"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        match v.kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            _ => panic!("unexpected kind"),
        }
    }

    #[test]
    fn nested_server_timestamps_keep_original_previous_value() {
        let first = FirestoreValue::server_timestamp_placeholder(
            Timestamp::new(1, 0),
            Some(FirestoreValue::from_integer(7)),
        );
        let second = FirestoreValue::server_timestamp_placeholder(Timestamp::new(2, 0), Some(first));
        match second.kind() {
            ValueKind::ServerTimestamp { previous_value, .. } => {
                assert_eq!(
                    previous_value.as_deref(),
                    Some(&FirestoreValue::from_integer(7))
                );
            }
            _ => panic!("expected placeholder"),
        }
    }

    #[test]
    fn non_finite_doubles_survive_json() {
        let value = FirestoreValue::from_double(f64::NAN);
        let json = serde_json::to_string(&value).unwrap();
        let back: FirestoreValue = serde_json::from_str(&json).unwrap();
        assert!(back.is_nan());
        assert_eq!(back, value);
    }
}
