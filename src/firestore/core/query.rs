use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::{canonical_value, compare_bound_to_document, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DocumentComparator, DocumentKey, FieldPath, MutableDocument, ResourcePath,
};
use crate::firestore::value::{compare_values, type_order, values_equal, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::ArrayContainsAny
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array() && value.as_array().map_or(true, |a| a.values().is_empty()) {
            return Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{}' filters.",
                op.as_str()
            )));
        }
        Ok(Self { field, op, value })
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_value(&self.value)
        )
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let other = field_value(document, &self.field);
        match self.op {
            Operator::NotEqual => other.is_some_and(|other| {
                !other.is_null() && compare_values(&other, &self.value) != Ordering::Equal
            }),
            Operator::ArrayContains => other
                .as_deref()
                .and_then(FirestoreValue::as_array)
                .is_some_and(|array| array.contains(&self.value)),
            Operator::ArrayContainsAny => {
                let Some(needles) = self.value.as_array() else {
                    return false;
                };
                other
                    .as_deref()
                    .and_then(FirestoreValue::as_array)
                    .is_some_and(|array| array.values().iter().any(|v| needles.contains(v)))
            }
            Operator::In => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                other.is_some_and(|other| candidates.contains(&other))
            }
            Operator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                other.is_some_and(|other| !other.is_null() && !candidates.contains(&other))
            }
            _ => other.is_some_and(|other| {
                type_order(&other) == type_order(&self.value)
                    && self.matches_comparison(compare_values(&other, &self.value))
            }),
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.op {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

/// Reads `path` from `document`, resolving `__name__` to a reference to the document.
pub(crate) fn field_value<'a>(
    document: &'a MutableDocument,
    path: &FieldPath,
) -> Option<Cow<'a, FirestoreValue>> {
    if path.is_key_field() {
        return Some(Cow::Owned(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        )));
    }
    document.field(path).map(Cow::Borrowed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn flipped(&self) -> Direction {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{direction}", self.field.canonical_string())
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        self.direction.apply(ordering)
    }
}

/// A cursor position over the query's order-by fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub(crate) fn canonical_position(&self) -> String {
        self.position
            .iter()
            .map(canonical_value)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let comparison = compare_bound_to_document(self, order_by, document);
        if self.inclusive {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let comparison = compare_bound_to_document(self, order_by, document);
        if self.inclusive {
            comparison != Ordering::Less
        } else {
            comparison == Ordering::Greater
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A user query over one collection, a collection group, or a single document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub explicit_order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub limit_type: LimitType,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Query {
    pub fn collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::collection(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::collection(key.path().clone())
    }

    /// Recreates a query from a persisted target. Limits are always limit-to-first.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path.clone(),
            collection_group: target.collection_group.clone(),
            filters: target.filters.clone(),
            explicit_order_by: target.order_by.clone(),
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at.clone(),
            end_at: target.end_at.clone(),
        }
    }

    pub fn filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: FieldPath, direction: Direction) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    /// True when the query returns every document of its collection in key order.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Fields that carry inequality filters, in field order.
    pub fn inequality_filter_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .filter(|filter| filter.op.is_inequality())
            .map(|filter| filter.field.clone())
            .collect()
    }

    /// Explicit orderings followed by implicit ones for inequality fields and the key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> =
            result.iter().map(|order| order.field.clone()).collect();
        let last_direction = result
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_filter_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_path()) {
            result.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        result
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        if self.limit_type == LimitType::First || self.limit.is_none() {
            return Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            };
        }
        // Limit-to-last runs as a limit-to-first query in the reverse order.
        Target {
            path: self.path.clone(),
            collection_group: self.collection_group.clone(),
            filters: self.filters.clone(),
            order_by: order_by
                .into_iter()
                .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                .collect(),
            limit: self.limit,
            start_at: self.end_at.clone(),
            end_at: self.start_at.clone(),
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == path
        } else {
            self.path.is_immediate_parent_of(path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &MutableDocument, right: &MutableDocument| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }
}

/// Equality filters on `field`, if any, used by index selection.
pub(crate) fn equality_value<'a>(query_filters: &'a [FieldFilter], field: &FieldPath) -> Option<&'a FirestoreValue> {
    query_filters
        .iter()
        .find(|filter| filter.op == Operator::Equal && &filter.field == field)
        .map(|filter| &filter.value)
}

/// Whether `value` satisfies every range filter on its field.
pub(crate) fn satisfies_range(filters: &[&FieldFilter], value: &FirestoreValue) -> bool {
    filters.iter().all(|filter| {
        type_order(value) == type_order(&filter.value)
            && match filter.op {
                Operator::LessThan => compare_values(value, &filter.value) == Ordering::Less,
                Operator::LessThanOrEqual => compare_values(value, &filter.value) != Ordering::Greater,
                Operator::GreaterThan => compare_values(value, &filter.value) == Ordering::Greater,
                Operator::GreaterThanOrEqual => compare_values(value, &filter.value) != Ordering::Less,
                Operator::Equal => values_equal(value, &filter.value)
                    || compare_values(value, &filter.value) == Ordering::Equal,
                _ => false,
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, fields: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (name, value) in fields {
            data.set(&field(name), value.clone());
        }
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap())
    }

    #[test]
    fn collection_query_matches_direct_children_only() {
        let query = rooms();
        assert!(query.matches(&doc("rooms/a", &[])));
        assert!(!query.matches(&doc("rooms/a/messages/1", &[])));
        assert!(!query.matches(&doc("halls/a", &[])));
    }

    #[test]
    fn collection_group_matches_nested_collections() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/1", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn equality_matches_across_numeric_types() {
        let query = rooms().filter(
            FieldFilter::new(field("size"), Operator::Equal, FirestoreValue::from_integer(1)).unwrap(),
        );
        assert!(query.matches(&doc("rooms/a", &[("size", FirestoreValue::from_double(1.0))])));
        assert!(!query.matches(&doc("rooms/b", &[("size", FirestoreValue::from_string("1"))])));
    }

    #[test]
    fn range_filters_require_matching_types() {
        let query = rooms().filter(
            FieldFilter::new(field("size"), Operator::GreaterThan, FirestoreValue::from_integer(2)).unwrap(),
        );
        assert!(query.matches(&doc("rooms/a", &[("size", FirestoreValue::from_integer(3))])));
        assert!(!query.matches(&doc("rooms/b", &[("size", FirestoreValue::from_string("z"))])));
        assert!(!query.matches(&doc("rooms/c", &[])));
    }

    #[test]
    fn not_in_excludes_missing_and_null_fields() {
        let query = rooms().filter(
            FieldFilter::new(
                field("tag"),
                Operator::NotIn,
                FirestoreValue::from_array(vec![FirestoreValue::from_string("x")]),
            )
            .unwrap(),
        );
        assert!(query.matches(&doc("rooms/a", &[("tag", FirestoreValue::from_string("y"))])));
        assert!(!query.matches(&doc("rooms/b", &[("tag", FirestoreValue::null())])));
        assert!(!query.matches(&doc("rooms/c", &[])));
    }

    #[test]
    fn array_operators() {
        let tags = FirestoreValue::from_array(vec![
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("b"),
        ]);
        let contains = rooms().filter(
            FieldFilter::new(field("tags"), Operator::ArrayContains, FirestoreValue::from_string("b")).unwrap(),
        );
        let any = rooms().filter(
            FieldFilter::new(
                field("tags"),
                Operator::ArrayContainsAny,
                FirestoreValue::from_array(vec![FirestoreValue::from_string("z"), FirestoreValue::from_string("a")]),
            )
            .unwrap(),
        );
        let document = doc("rooms/a", &[("tags", tags)]);
        assert!(contains.matches(&document));
        assert!(any.matches(&document));
        assert!(FieldFilter::new(field("tags"), Operator::In, FirestoreValue::from_integer(1)).is_err());
    }

    #[test]
    fn normalized_order_adds_inequality_and_key() {
        let query = rooms()
            .filter(FieldFilter::new(field("size"), Operator::LessThan, FirestoreValue::from_integer(9)).unwrap())
            .order_by(field("name"), Direction::Descending);
        let order: Vec<String> = query
            .normalized_order_by()
            .iter()
            .map(OrderBy::canonical_id)
            .collect();
        assert_eq!(order, vec!["namedesc", "sizedesc", "__name__desc"]);
    }

    #[test]
    fn order_by_excludes_documents_missing_the_field() {
        let query = rooms().order_by(field("rank"), Direction::Ascending);
        assert!(!query.matches(&doc("rooms/a", &[])));
        assert!(query.matches(&doc("rooms/b", &[("rank", FirestoreValue::from_integer(1))])));
    }

    #[test]
    fn bounds_restrict_results() {
        let query = rooms()
            .order_by(field("rank"), Direction::Ascending)
            .start_at(Bound::new(vec![FirestoreValue::from_integer(2)], true))
            .end_at(Bound::new(vec![FirestoreValue::from_integer(4)], false));
        let rank = |n| doc(&format!("rooms/{n}"), &[("rank", FirestoreValue::from_integer(n))]);
        assert!(!query.matches(&rank(1)));
        assert!(query.matches(&rank(2)));
        assert!(query.matches(&rank(3)));
        assert!(!query.matches(&rank(4)));
    }

    #[test]
    fn limit_to_last_flips_target_order() {
        let query = rooms()
            .order_by(field("rank"), Direction::Ascending)
            .start_at(Bound::new(vec![FirestoreValue::from_integer(1)], true))
            .limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by[0].direction, Direction::Descending);
        assert!(target.start_at.is_none());
        assert!(target.end_at.is_some());
        assert_ne!(query.canonical_id(), query.clone().limit_to_first(2).canonical_id());
    }

    #[test]
    fn comparator_orders_by_fields_then_key() {
        let query = rooms().order_by(field("rank"), Direction::Descending);
        let a = doc("rooms/a", &[("rank", FirestoreValue::from_integer(1))]);
        let b = doc("rooms/b", &[("rank", FirestoreValue::from_integer(2))]);
        let c = doc("rooms/c", &[("rank", FirestoreValue::from_integer(2))]);
        assert_eq!(query.compare(&b, &a), Ordering::Less);
        assert_eq!(query.compare(&c, &b), Ordering::Less);
    }
}
