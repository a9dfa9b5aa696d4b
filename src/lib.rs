//! Offline cache, mutation queue, watch synchronization and multi-client
//! coordination for Cloud Firestore clients.
//!
//! The network boundary is the [`firestore::remote::Datastore`] trait. The
//! bundled [`firestore::remote::InMemoryDatastore`] hands every stream the
//! client opens to the caller, which then plays the backend.

pub mod firestore;
pub mod platform;
pub mod util;
