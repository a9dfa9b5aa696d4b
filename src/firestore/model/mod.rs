mod database_id;
mod document;
mod document_key;
mod document_set;
mod field_index;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod user;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_index::{FieldIndex, IndexKind, IndexSegment};
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationResult, Precondition,
    TransformOperation,
};
pub use mutation_batch::{
    BatchId, MutationBatch, MutationBatchResult, OverlayedDocument, BATCH_ID_UNKNOWN,
};
pub use overlay::Overlay;
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use user::User;
