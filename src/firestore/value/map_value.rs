use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Field map of a document or of a nested map value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a possibly nested field.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.fields.get(segment)?.as_map()?;
        }
        current.fields.get(last)
    }

    /// Writes `value` at `path`, replacing non-map intermediates with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            let entry = current
                .fields
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map_value(MapValue::empty());
            }
            current = match entry.as_map_mut() {
                Some(map) => map,
                None => return,
            };
        }
        current.fields.insert(last.clone(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            current = match current.fields.get_mut(segment).and_then(|v| v.as_map_mut()) {
                Some(map) => map,
                None => return,
            };
        }
        current.fields.remove(last);
    }

    /// Applies `Some` values as writes and `None` values as deletes.
    pub fn set_all(&mut self, updates: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Paths of every leaf value. Empty nested maps count as leaves.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(self, None, &mut paths);
        paths
    }
}

fn collect_leaf_paths(map: &MapValue, prefix: Option<&FieldPath>, out: &mut Vec<FieldPath>) {
    for (name, value) in &map.fields {
        let path = match prefix {
            Some(prefix) => prefix.child(name.clone()),
            None => match FieldPath::new([name.clone()]) {
                Ok(path) => path,
                Err(_) => continue,
            },
        };
        match value.kind() {
            ValueKind::Map(nested) if !nested.is_empty() => {
                collect_leaf_paths(nested, Some(&path), out)
            }
            _ => out.push(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn sets_and_reads_nested_fields() {
        let mut map = MapValue::empty();
        map.set(&field("address.city"), FirestoreValue::from_string("Lisbon"));
        map.set(&field("name"), FirestoreValue::from_string("Ana"));
        assert_eq!(
            map.get(&field("address.city")),
            Some(&FirestoreValue::from_string("Lisbon"))
        );
        assert!(map.get(&field("address.zip")).is_none());
        assert!(map.get(&field("name.first")).is_none());
    }

    #[test]
    fn set_replaces_scalar_intermediates() {
        let mut map = MapValue::empty();
        map.set(&field("a"), FirestoreValue::from_integer(1));
        map.set(&field("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(map.get(&field("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn delete_removes_nested_field_only() {
        let mut map = MapValue::empty();
        map.set(&field("a.b"), FirestoreValue::from_integer(1));
        map.set(&field("a.c"), FirestoreValue::from_integer(2));
        map.delete(&field("a.b"));
        assert!(map.get(&field("a.b")).is_none());
        assert!(map.get(&field("a.c")).is_some());
    }

    #[test]
    fn leaf_paths_descend_into_maps() {
        let mut map = MapValue::empty();
        map.set(&field("a.b"), FirestoreValue::from_integer(1));
        map.set(&field("c"), FirestoreValue::from_map_value(MapValue::empty()));
        let paths: Vec<String> = map.leaf_paths().iter().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["a.b".to_string(), "c".to_string()]);
    }
}
