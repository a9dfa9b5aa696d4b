//! Total ordering and equality across all value types.
//!
//! Values of different types order by type: null, booleans, numbers, timestamps,
//! pending server timestamps, strings, bytes, references, geo points, arrays, maps.
//! Integers and doubles share one numeric type; NaN sorts before every other number.

use std::cmp::Ordering;

use crate::firestore::model::ResourcePath;
use crate::firestore::value::{FirestoreValue, ValueKind};

pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp { .. } => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.as_bytes().cmp(r.as_bytes()),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (a, b) in l.values().iter().zip(r.values().iter()) {
                match compare_values(a, b) {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((lk, lv), (rk, rv)) in l.fields().iter().zip(r.fields().iter()) {
                match lk.as_bytes().cmp(rk.as_bytes()) {
                    Ordering::Equal => {}
                    ordering => return ordering,
                }
                match compare_values(lv, rv) {
                    Ordering::Equal => {}
                    ordering => return ordering,
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => compare_numbers(left, right),
    }
}

fn compare_numbers(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    match (left.kind(), right.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_doubles(*l as f64, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_doubles(*l, *r as f64),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        _ => Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // -0.0 and 0.0 compare equal here.
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left = ResourcePath::from_string(left).unwrap_or_default();
    let right = ResourcePath::from_string(right).unwrap_or_default();
    left.cmp(&right)
}

/// Structural equality. Integers never equal doubles, NaN equals NaN and
/// doubles compare by bit pattern so `0.0 != -0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    kinds_equal(left.kind(), right.kind())
}

fn kinds_equal(left: &ValueKind, right: &ValueKind) -> bool {
    match (left, right) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l == r,
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l
                    .values()
                    .iter()
                    .zip(r.values().iter())
                    .all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l
                    .fields()
                    .iter()
                    .zip(r.fields().iter())
                    .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        _ => false,
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

impl PartialEq for ValueKind {
    fn eq(&self, other: &Self) -> bool {
        kinds_equal(self, other)
    }
}

/// Whether `haystack` contains an element equal to `needle`.
pub fn array_contains(haystack: &[FirestoreValue], needle: &FirestoreValue) -> bool {
    haystack.iter().any(|candidate| values_equal(candidate, needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = [
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(1.5),
            FirestoreValue::from_integer(2),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::server_timestamp_placeholder(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_reference("rooms/a"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                compare_values(&window[0], &window[1]),
                Ordering::Less,
                "{:?} < {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn integers_and_doubles_compare_numerically_but_are_not_equal() {
        let one = FirestoreValue::from_integer(1);
        let one_double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&one, &one_double), Ordering::Equal);
        assert_ne!(one, one_double);
    }

    #[test]
    fn arrays_compare_element_wise_then_by_length() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        let bigger = FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
        assert_eq!(compare_values(&long, &bigger), Ordering::Less);
    }
}
