//! Client-side Cloud Firestore synchronization: the offline cache, the
//! mutation queue, watch stream handling with limbo resolution, and
//! coordination between several clients sharing one cache.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

#[doc(inline)]
pub use self::core::{
    ChangeType, DocumentViewChange, FirestoreClient, ListenOptions, ListenerCallback,
    ListenerRegistration, Query, ViewSnapshot, WriteCompletion,
};
#[doc(inline)]
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
#[doc(inline)]
pub use settings::{FirestoreSettings, PersistenceSettings};
