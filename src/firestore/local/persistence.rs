use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{from_str as deserialize_state, to_string as serialize_state};

use crate::firestore::error::{
    failed_precondition, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::primary_lease::{ClientMetadata, PrimaryLease};
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::settings::PersistenceSettings;

pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current client lost its primary lease. Operations that need the primary lease can only run on the primary client.";

/// Swallows the error a primary-only transaction raises once another client
/// took the lease. Every other error is returned.
pub fn ignore_if_primary_lease_loss(err: FirestoreError) -> FirestoreResult<()> {
    if err.code == FirestoreErrorCode::FailedPrecondition && err.message() == PRIMARY_LEASE_LOST_ERROR_MSG {
        log::debug!("unexpectedly lost primary lease");
        Ok(())
    } else {
        Err(err)
    }
}

/// Everything the local cache stores, shared by all clients of one persistence.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub mutation_queue: MutationQueue,
    pub remote_documents: RemoteDocumentCache,
    pub target_cache: TargetCache,
    pub overlays: DocumentOverlayCache,
    pub index_manager: IndexManager,
    pub primary_lease: Option<PrimaryLease>,
    pub client_metadata: BTreeMap<String, ClientMetadata>,
}

impl PersistedState {
    /// Caches `document` and keeps the field indexes in step with it.
    pub fn set_remote_document(
        &mut self,
        document: MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        self.index_manager.update_index_entries(&document);
        self.remote_documents.set_entry(document, read_time)
    }

    pub fn remove_remote_document(&mut self, key: &DocumentKey) {
        self.index_manager.remove_document(key);
        self.remote_documents.remove_entry(key);
    }
}

/// Durable home of the persisted state.
pub trait StorageBackend: Send + Sync {
    fn load(&self) -> FirestoreResult<Option<PersistedState>>;
    fn commit(&self, state: &PersistedState) -> FirestoreResult<()>;
    fn is_durable(&self) -> bool;
}

/// Keeps nothing beyond the in-process state.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStorageBackend;

impl StorageBackend for MemoryStorageBackend {
    fn load(&self) -> FirestoreResult<Option<PersistedState>> {
        Ok(None)
    }

    fn commit(&self, _state: &PersistedState) -> FirestoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Stores the state as JSON. Commits write a sibling temp file and rename it
/// over the target so a crash never leaves a half written cache.
#[derive(Debug, Clone)]
pub struct FileStorageBackend {
    path: PathBuf,
}

impl FileStorageBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StorageBackend for FileStorageBackend {
    fn load(&self) -> FirestoreResult<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)
            .map_err(|err| internal_error(format!("Failed to open persistence file: {err}")))?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)
            .map_err(|err| internal_error(format!("Failed to read persistence file: {err}")))?;
        if buffer.is_empty() {
            return Ok(None);
        }
        let state = deserialize_state(&buffer)
            .map_err(|err| internal_error(format!("Failed to parse persistence file: {err}")))?;
        Ok(Some(state))
    }

    fn commit(&self, state: &PersistedState) -> FirestoreResult<()> {
        let serialized = serialize_state(state)
            .map_err(|err| internal_error(format!("Failed to serialize persisted state: {err}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                internal_error(format!("Failed to create persistence directory: {err}"))
            })?;
        }
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)
            .map_err(|err| internal_error(format!("Failed to create persistence file: {err}")))?;
        file.write_all(serialized.as_bytes())
            .map_err(|err| internal_error(format!("Failed to write persistence file: {err}")))?;
        file.sync_all()
            .map_err(|err| internal_error(format!("Failed to flush persistence file: {err}")))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|err| internal_error(format!("Failed to replace persistence file: {err}")))?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// How a transaction may touch the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode<'a> {
    /// Changes made by the closure are discarded.
    ReadOnly,
    ReadWrite,
    /// Like `ReadWrite`, but only while `client_id` holds the primary lease.
    ReadWritePrimary(&'a str),
}

/// The shared local cache. Every change goes through `run_transaction`, which
/// commits all of a closure's changes or none of them.
pub struct Persistence {
    state: Mutex<PersistedState>,
    backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("durable", &self.is_durable())
            .finish()
    }
}

impl Persistence {
    pub fn memory() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PersistedState::default()),
            backend: Arc::new(MemoryStorageBackend),
        })
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> FirestoreResult<Arc<Self>> {
        let state = backend.load()?.unwrap_or_default();
        Ok(Arc::new(Self {
            state: Mutex::new(state),
            backend,
        }))
    }

    /// Opens the configured persistence. A file that cannot be loaded is
    /// reported and replaced by a memory-only cache.
    pub fn open(settings: &PersistenceSettings) -> Arc<Self> {
        match settings {
            PersistenceSettings::Memory => Self::memory(),
            PersistenceSettings::File { path } => {
                match Self::with_backend(Arc::new(FileStorageBackend::new(path))) {
                    Ok(persistence) => persistence,
                    Err(err) => {
                        log::warn!(
                            "failed to open persistence at {}, falling back to memory cache: {err}",
                            path.display()
                        );
                        Self::memory()
                    }
                }
            }
        }
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    /// Reads the current state without copying it.
    pub fn read<T, F>(&self, action: &str, f: F) -> FirestoreResult<T>
    where
        F: FnOnce(&PersistedState) -> FirestoreResult<T>,
    {
        let guard = self.lock();
        f(&guard).map_err(|err| {
            log::debug!("read '{action}' failed: {err}");
            err
        })
    }

    /// Runs `f` against a working copy of the state. On `Ok` the copy is
    /// committed to the backend and replaces the current state; on `Err` the
    /// state is left untouched.
    pub fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode<'_>, f: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistedState) -> FirestoreResult<T>,
    {
        let mut guard = self.lock();
        if let TransactionMode::ReadWritePrimary(client_id) = mode {
            let holds_lease = guard
                .primary_lease
                .as_ref()
                .is_some_and(|lease| lease.owner_id == client_id);
            if !holds_lease {
                return Err(failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG));
            }
        }

        let mut working = guard.clone();
        let result = f(&mut working).map_err(|err| {
            log::debug!("transaction '{action}' failed: {err}");
            err
        })?;
        if mode != TransactionMode::ReadOnly {
            self.backend.commit(&working).map_err(|err| {
                log::warn!("failed to commit transaction '{action}': {err}");
                err
            })?;
            *guard = working;
        }
        Ok(result)
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::invalid_argument;
    use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("firestore-sync-test-{}-{}.json", name, std::process::id()));
        path
    }

    fn add_document(state: &mut PersistedState, path: &str) -> FirestoreResult<()> {
        let document = MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::empty(),
        );
        state
            .remote_documents
            .set_entry(document, SnapshotVersion::from_micros(1))
    }

    #[test]
    fn failed_transactions_leave_state_untouched() {
        let persistence = Persistence::memory();
        let result: FirestoreResult<()> =
            persistence.run_transaction("fail", TransactionMode::ReadWrite, |state| {
                add_document(state, "rooms/a")?;
                Err(invalid_argument("boom"))
            });
        assert!(result.is_err());
        let count = persistence
            .read("count", |state| Ok(state.remote_documents.len()))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn read_only_transactions_discard_changes() {
        let persistence = Persistence::memory();
        persistence
            .run_transaction("read", TransactionMode::ReadOnly, |state| add_document(state, "rooms/a"))
            .unwrap();
        let count = persistence
            .read("count", |state| Ok(state.remote_documents.len()))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn primary_transactions_require_the_lease() {
        let persistence = Persistence::memory();
        let err = persistence
            .run_transaction("write", TransactionMode::ReadWritePrimary("me"), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");

        persistence
            .run_transaction("lease", TransactionMode::ReadWrite, |state| {
                state.primary_lease = Some(PrimaryLease {
                    owner_id: "me".into(),
                    lease_timestamp_ms: 0,
                    allow_tab_synchronization: false,
                });
                Ok(())
            })
            .unwrap();
        assert!(persistence
            .run_transaction("write", TransactionMode::ReadWritePrimary("me"), |_| Ok(()))
            .is_ok());
    }

    #[test]
    fn file_backend_survives_reopen() {
        let path = temp_path("reopen");
        let _ = fs::remove_file(&path);
        let persistence = Persistence::open(&PersistenceSettings::file(&path));
        assert!(persistence.is_durable());
        persistence
            .run_transaction("add", TransactionMode::ReadWrite, |state| add_document(state, "rooms/a"))
            .unwrap();

        let reopened = Persistence::open(&PersistenceSettings::file(&path));
        let count = reopened
            .read("count", |state| Ok(state.remote_documents.len()))
            .unwrap();
        assert_eq!(count, 1);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn unreadable_file_falls_back_to_memory() {
        let path = temp_path("corrupt");
        fs::write(&path, "not json").unwrap();
        let persistence = Persistence::open(&PersistenceSettings::file(&path));
        assert!(!persistence.is_durable());
        let _ = fs::remove_file(path);
    }
}
