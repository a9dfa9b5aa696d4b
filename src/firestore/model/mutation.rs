use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> FirestoreResult<Self> {
        if let TransformOperation::NumericIncrement(operand) = &operation {
            if !operand.is_number() {
                return Err(invalid_argument(
                    "Numeric increments require an integer or double operand",
                ));
            }
        }
        Ok(Self { field, operation })
    }

    /// Result visible locally before the server has confirmed the write.
    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp_placeholder(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(existing_array(previous).union_with(elements).values().to_vec())
            }
            TransformOperation::ArrayRemove(elements) => {
                FirestoreValue::from_array(existing_array(previous).remove_all(elements).values().to_vec())
            }
            TransformOperation::NumericIncrement(operand) => {
                numeric_sum(&increment_base(previous), operand)
            }
        }
    }

    fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: FirestoreValue,
    ) -> FirestoreValue {
        match &self.operation {
            // The backend does not echo array transforms; replay them locally.
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(existing_array(previous).union_with(elements).values().to_vec())
            }
            TransformOperation::ArrayRemove(elements) => {
                FirestoreValue::from_array(existing_array(previous).remove_all(elements).values().to_vec())
            }
            _ => server_result,
        }
    }

    /// Value that must be captured at write time so that retries stay idempotent.
    fn base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match &self.operation {
            TransformOperation::NumericIncrement(_) => Some(increment_base(previous)),
            _ => None,
        }
    }
}

fn existing_array(previous: Option<&FirestoreValue>) -> ArrayValue {
    previous
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn increment_base(previous: Option<&FirestoreValue>) -> FirestoreValue {
    match previous {
        Some(value) if value.is_number() => value.clone(),
        _ => FirestoreValue::from_integer(0),
    }
}

fn numeric_sum(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => FirestoreValue::from_integer(l.saturating_add(*r)),
        (ValueKind::Integer(l), ValueKind::Double(r)) => FirestoreValue::from_double(*l as f64 + r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => FirestoreValue::from_double(l + *r as f64),
        (ValueKind::Double(l), ValueKind::Double(r)) => FirestoreValue::from_double(l + r),
        _ => base.clone(),
    }
}

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<I: IntoIterator<Item = FieldPath>>(&self, other: I) -> FieldMask {
        let mut fields = self.fields.clone();
        fields.extend(other);
        FieldMask { fields }
    }
}

/// Outcome of one write as reported by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Commit version of the document, or the batch commit version for deletes.
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Patch {
        key: DocumentKey,
        value: MapValue,
        mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Asserts a precondition without writing. Never changes local documents.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Patch touching exactly the leaf fields of `value`; requires the document to exist.
    pub fn patch(key: DocumentKey, value: MapValue) -> Self {
        let mask = FieldMask::new(value.leaf_paths());
        Mutation::Patch {
            key,
            value,
            mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => *field_transforms = transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Fields this mutation changes, or `None` when it replaces the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match self {
            Mutation::Patch {
                mask,
                field_transforms,
                ..
            } => Some(mask.union_with(field_transforms.iter().map(|t| t.field.clone()))),
            _ => None,
        }
    }

    /// Applies the mutation to the local view of `document` and returns the
    /// accumulated mask of changed fields (`None` when the whole document changed).
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let results = local_transform_results(field_transforms, document, local_write_time);
                let mut data = value.clone();
                data.set_all(results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                value,
                mask,
                field_transforms,
                ..
            } => {
                let results = local_transform_results(field_transforms, document, local_write_time);
                let mut data = document.data().clone();
                data.set_all(patch_updates(value, mask));
                data.set_all(results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union_with(mask.fields().iter().cloned())
                        .union_with(field_transforms.iter().map(|t| t.field.clone()))
                })
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies the acknowledged result of this mutation to the cached remote document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let results = server_transform_results(field_transforms, document, &result.transform_results)?;
                let mut data = value.clone();
                data.set_all(results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
                Ok(())
            }
            Mutation::Patch {
                value,
                mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    // The write succeeded but the base document is not cached.
                    document.convert_to_unknown_document(result.version);
                    return Ok(());
                }
                let results = server_transform_results(field_transforms, document, &result.transform_results)?;
                let mut data = document.data().clone();
                data.set_all(patch_updates(value, mask));
                data.set_all(results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
                Ok(())
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
                Ok(())
            }
            Mutation::Verify { .. } => Err(internal_error(
                "Verify mutations are never applied to cached documents",
            )),
        }
    }

    /// Captures the numeric bases of increment transforms, if any, as a map
    /// suitable for a base patch.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base = MapValue::empty();
        let mut found = false;
        for transform in self.field_transforms() {
            let existing = document.field(&transform.field);
            if let Some(value) = transform.base_value(existing) {
                base.set(&transform.field, value);
                found = true;
            }
        }
        found.then_some(base)
    }
}

fn patch_updates(value: &MapValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.fields()
        .iter()
        .filter(|path| !path.is_empty())
        .map(|path| (path.clone(), value.get(path).cloned()))
        .collect()
}

fn local_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    local_write_time: Timestamp,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.field(&transform.field);
            (
                transform.field.clone(),
                Some(transform.apply_to_local_view(previous, local_write_time)),
            )
        })
        .collect()
}

fn server_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    server_results: &[FirestoreValue],
) -> FirestoreResult<BTreeMap<FieldPath, Option<FirestoreValue>>> {
    if transforms.len() != server_results.len() {
        return Err(internal_error(format!(
            "Server returned {} transform results for {} transforms",
            server_results.len(),
            transforms.len()
        )));
    }
    Ok(transforms
        .iter()
        .zip(server_results.iter())
        .map(|(transform, server_result)| {
            let previous = document.field(&transform.field);
            (
                transform.field.clone(),
                Some(transform.apply_to_remote_document(previous, server_result.clone())),
            )
        })
        .collect())
}

/// Builds the single mutation that turns the remote version of `document` into its
/// current local view. `mask` is `None` when the document was replaced entirely.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
        return None;
    }

    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };

    let mut patch_value = MapValue::empty();
    let mut mask_set = BTreeSet::new();
    for path in mask.fields() {
        if mask_set.contains(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = document.field(&path).cloned();
        // A missing nested field means its parent was overwritten with a non-map.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = document.field(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value),
            None => patch_value.delete(&path),
        }
        mask_set.insert(path);
    }

    Some(Mutation::Patch {
        key: document.key().clone(),
        value: patch_value,
        mask: FieldMask { fields: mask_set },
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}
