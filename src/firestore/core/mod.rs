pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, ListenerCallback, QueryListener};
pub use firestore_client::{FirestoreClient, ListenerRegistration};
pub use query::{Bound, Direction, FieldFilter, LimitType, Operator, OrderBy, Query};
pub use sync_engine::{OnlineStateSource, SyncEngine, SyncEngineListener, WriteCompletion};
pub use target::Target;
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentViewChange, SyncState, ViewSnapshot};
