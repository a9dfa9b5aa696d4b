use serde::{Deserialize, Serialize};

use crate::firestore::value::ordering::array_contains;
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn contains(&self, value: &FirestoreValue) -> bool {
        array_contains(&self.values, value)
    }

    /// Appends each element not already present.
    pub fn union_with(&self, elements: &[FirestoreValue]) -> ArrayValue {
        let mut values = self.values.clone();
        for element in elements {
            if !array_contains(&values, element) {
                values.push(element.clone());
            }
        }
        ArrayValue::new(values)
    }

    /// Drops every occurrence of each element.
    pub fn remove_all(&self, elements: &[FirestoreValue]) -> ArrayValue {
        ArrayValue::new(
            self.values
                .iter()
                .filter(|value| !array_contains(elements, value))
                .cloned()
                .collect(),
        )
    }
}
