use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{Bound, Direction, FieldFilter, OrderBy};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{compare_values, FirestoreValue, ValueKind};

/// The backend facing form of a query: what the watch stream listens to and
/// what the local target cache is keyed by.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// A target matching exactly one document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: vec![OrderBy::new(FieldPath::key_path(), Direction::Ascending)],
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Stable string identity. Equal targets always share a canonical id.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(FieldFilter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        id.push_str("|ob:");
        id.push_str(
            &self
                .order_by
                .iter()
                .map(OrderBy::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if start.inclusive { "b:" } else { "a:" });
            id.push_str(&start.canonical_position());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if end.inclusive { "a:" } else { "b:" });
            id.push_str(&end.canonical_position());
        }
        id
    }
}

/// Canonical rendering of a value for use in target ids.
pub fn canonical_value(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(b) => b.to_string(),
        ValueKind::Integer(i) => i.to_string(),
        ValueKind::Double(d) => format!("{d:?}"),
        ValueKind::Timestamp(t) => format!("time({},{})", t.seconds, t.nanos),
        ValueKind::ServerTimestamp {
            local_write_time, ..
        } => format!(
            "serverTime({},{})",
            local_write_time.seconds, local_write_time.nanos
        ),
        ValueKind::String(s) => s.clone(),
        ValueKind::Bytes(bytes) => bytes.to_base64(),
        ValueKind::Reference(path) => path.clone(),
        ValueKind::GeoPoint(point) => format!("geo({},{})", point.latitude(), point.longitude()),
        ValueKind::Array(array) => format!(
            "[{}]",
            array
                .values()
                .iter()
                .map(canonical_value)
                .collect::<Vec<_>>()
                .join(",")
        ),
        ValueKind::Map(map) => format!(
            "{{{}}}",
            map.fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_value(value)))
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}

/// Compares a cursor position with a document under `order_by`. Negative means
/// the bound sorts before the document.
pub(crate) fn compare_bound_to_document(
    bound: &Bound,
    order_by: &[OrderBy],
    document: &MutableDocument,
) -> Ordering {
    for (component, order) in bound.position.iter().zip(order_by.iter()) {
        let comparison = if order.field.is_key_field() {
            let key_value = FirestoreValue::from_reference(document.key().path().canonical_string());
            compare_values(component, &key_value)
        } else {
            match document.field(&order.field) {
                Some(value) => compare_values(component, value),
                None => Ordering::Greater,
            }
        };
        let comparison = order.direction.apply(comparison);
        if comparison != Ordering::Equal {
            return comparison;
        }
    }
    Ordering::Equal
}
