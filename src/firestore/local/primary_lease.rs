use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::persistence::{PersistedState, Persistence, TransactionMode};
use crate::util::clock::Clock;

pub const PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG: &str =
    "There is another client open with offline persistence enabled. Only one such client is allowed at a time. The other client must be closed or persistence must be disabled.";

/// Metadata of clients that stopped refreshing for this long is dropped.
const MAX_CLIENT_AGE_MS: i64 = 30 * 60 * 1_000;

/// The single record naming the client that owns the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryLease {
    pub owner_id: String,
    pub lease_timestamp_ms: i64,
    pub allow_tab_synchronization: bool,
}

/// Liveness record every client refreshes on each heartbeat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

/// Runs the lease protocol for one client.
///
/// Acquisition and refresh happen inside persistence transactions, so two
/// clients racing for an expired lease are serialized and at most one of them
/// ends up holding it.
pub struct PrimaryLeaseManager {
    persistence: Arc<Persistence>,
    client_id: String,
    clock: Arc<dyn Clock>,
    max_lease_age_ms: i64,
    allow_tab_synchronization: bool,
    force_ownership: bool,
    network_enabled: AtomicBool,
    in_foreground: AtomicBool,
    is_primary: AtomicBool,
}

impl PrimaryLeaseManager {
    pub fn new(
        persistence: Arc<Persistence>,
        client_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        max_lease_age: Duration,
        allow_tab_synchronization: bool,
        force_ownership: bool,
    ) -> Self {
        Self {
            persistence,
            client_id: client_id.into(),
            clock,
            max_lease_age_ms: i64::try_from(max_lease_age.as_millis()).unwrap_or(i64::MAX),
            allow_tab_synchronization,
            force_ownership,
            network_enabled: AtomicBool::new(true),
            in_foreground: AtomicBool::new(true),
            is_primary: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn set_network_enabled(&self, enabled: bool) {
        self.network_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_in_foreground(&self, in_foreground: bool) {
        self.in_foreground.store(in_foreground, Ordering::SeqCst);
    }

    /// First acquisition attempt. A client that does not synchronize with
    /// others must become primary or fail.
    pub fn start(&self) -> FirestoreResult<bool> {
        let is_primary = self.try_acquire_or_extend()?;
        if !is_primary && !self.allow_tab_synchronization {
            return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
        }
        Ok(is_primary)
    }

    /// Heartbeat: refreshes this client's metadata, then takes or extends the
    /// lease when this client may act as primary and gives it up otherwise.
    /// Returns whether this client is primary afterwards.
    pub fn try_acquire_or_extend(&self) -> FirestoreResult<bool> {
        let now = self.clock.now_millis();
        let network_enabled = self.network_enabled.load(Ordering::SeqCst);
        let in_foreground = self.in_foreground.load(Ordering::SeqCst);

        let result = self
            .persistence
            .run_transaction("refresh primary lease", TransactionMode::ReadWrite, |state| {
                state.client_metadata.insert(
                    self.client_id.clone(),
                    ClientMetadata {
                        client_id: self.client_id.clone(),
                        update_time_ms: now,
                        network_enabled,
                        in_foreground,
                    },
                );
                state
                    .client_metadata
                    .retain(|_, client| now - client.update_time_ms < MAX_CLIENT_AGE_MS);

                if self.can_act_as_primary(state, now, network_enabled, in_foreground)? {
                    state.primary_lease = Some(PrimaryLease {
                        owner_id: self.client_id.clone(),
                        lease_timestamp_ms: now,
                        allow_tab_synchronization: self.allow_tab_synchronization,
                    });
                    Ok(true)
                } else {
                    if self.holds_lease(state) {
                        state.primary_lease = None;
                    }
                    Ok(false)
                }
            });

        match result {
            Ok(is_primary) => {
                let was_primary = self.is_primary.swap(is_primary, Ordering::SeqCst);
                if was_primary != is_primary {
                    if is_primary {
                        log::debug!("client {} acquired the primary lease", self.client_id);
                    } else {
                        log::debug!("client {} lost the primary lease", self.client_id);
                    }
                }
                Ok(is_primary)
            }
            Err(err) => {
                self.is_primary.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Gives up the lease (if held) and removes this client's metadata.
    pub fn release(&self) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("release primary lease", TransactionMode::ReadWrite, |state| {
                if self.holds_lease(state) {
                    state.primary_lease = None;
                }
                state.client_metadata.remove(&self.client_id);
                Ok(())
            })?;
        self.is_primary.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Ids of clients whose metadata was refreshed within the lease age.
    pub fn active_clients(&self) -> FirestoreResult<Vec<String>> {
        let now = self.clock.now_millis();
        self.persistence.read("active clients", |state| {
            Ok(state
                .client_metadata
                .values()
                .filter(|client| self.is_within_age(client.update_time_ms, now))
                .map(|client| client.client_id.clone())
                .collect())
        })
    }

    fn holds_lease(&self, state: &PersistedState) -> bool {
        state
            .primary_lease
            .as_ref()
            .is_some_and(|lease| lease.owner_id == self.client_id)
    }

    fn is_within_age(&self, timestamp_ms: i64, now: i64) -> bool {
        now - timestamp_ms < self.max_lease_age_ms
    }

    fn can_act_as_primary(
        &self,
        state: &PersistedState,
        now: i64,
        network_enabled: bool,
        in_foreground: bool,
    ) -> FirestoreResult<bool> {
        if let Some(lease) = &state.primary_lease {
            if self.is_within_age(lease.lease_timestamp_ms, now) {
                if lease.owner_id == self.client_id {
                    if network_enabled {
                        return Ok(true);
                    }
                } else {
                    if self.force_ownership {
                        return Ok(true);
                    }
                    if !lease.allow_tab_synchronization {
                        return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
                    }
                    return Ok(false);
                }
            }
        }

        if network_enabled && in_foreground {
            return Ok(true);
        }

        // Leave the lease to a live client that is better placed to hold it.
        let better_candidate = state.client_metadata.values().any(|other| {
            if other.client_id == self.client_id || !self.is_within_age(other.update_time_ms, now) {
                return false;
            }
            let better_network = !network_enabled && other.network_enabled;
            let better_visibility = !in_foreground && other.in_foreground;
            let same_network = network_enabled == other.network_enabled;
            better_network || (better_visibility && same_network)
        });
        Ok(!better_candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;

    fn manager(
        persistence: &Arc<Persistence>,
        id: &str,
        clock: &ManualClock,
        allow_tab_synchronization: bool,
    ) -> PrimaryLeaseManager {
        PrimaryLeaseManager::new(
            persistence.clone(),
            id,
            Arc::new(clock.clone()),
            Duration::from_secs(5),
            allow_tab_synchronization,
            false,
        )
    }

    #[test]
    fn only_one_client_holds_the_lease() {
        let persistence = Persistence::memory();
        let clock = ManualClock::new(1_000_000);
        let first = manager(&persistence, "first", &clock, true);
        let second = manager(&persistence, "second", &clock, true);

        assert!(first.start().unwrap());
        assert!(!second.start().unwrap());
        assert!(first.try_acquire_or_extend().unwrap());
        assert!(!second.try_acquire_or_extend().unwrap());
    }

    #[test]
    fn stale_lease_is_taken_over() {
        let persistence = Persistence::memory();
        let clock = ManualClock::new(1_000_000);
        let first = manager(&persistence, "first", &clock, true);
        let second = manager(&persistence, "second", &clock, true);
        assert!(first.start().unwrap());

        clock.advance_millis(6_000);
        assert!(second.try_acquire_or_extend().unwrap());
        assert!(!first.try_acquire_or_extend().unwrap());
        assert!(!first.is_primary());
    }

    #[test]
    fn unbounded_lease_age_never_expires() {
        let persistence = Persistence::memory();
        let clock = ManualClock::new(1_000_000);
        let lease = |id: &str| {
            PrimaryLeaseManager::new(
                persistence.clone(),
                id,
                Arc::new(clock.clone()),
                Duration::MAX,
                true,
                false,
            )
        };
        let first = lease("first");
        let second = lease("second");
        assert!(first.start().unwrap());

        clock.advance_millis(365 * 24 * 60 * 60 * 1_000);
        assert!(!second.try_acquire_or_extend().unwrap());
        assert!(first.try_acquire_or_extend().unwrap());
    }

    #[test]
    fn exclusive_holder_rejects_other_clients() {
        let persistence = Persistence::memory();
        let clock = ManualClock::new(1_000_000);
        let exclusive = manager(&persistence, "exclusive", &clock, false);
        assert!(exclusive.start().unwrap());

        let other = manager(&persistence, "other", &clock, true);
        let err = other.start().unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }

    #[test]
    fn force_ownership_takes_a_valid_lease() {
        let persistence = Persistence::memory();
        let clock = ManualClock::new(1_000_000);
        let first = manager(&persistence, "first", &clock, true);
        assert!(first.start().unwrap());

        let forcing = PrimaryLeaseManager::new(
            persistence.clone(),
            "forcing",
            Arc::new(clock.clone()),
            Duration::from_secs(5),
            true,
            true,
        );
        assert!(forcing.start().unwrap());
        assert!(!first.try_acquire_or_extend().unwrap());
    }

    #[test]
    fn release_frees_the_lease() {
        let persistence = Persistence::memory();
        let clock = ManualClock::new(1_000_000);
        let first = manager(&persistence, "first", &clock, true);
        let second = manager(&persistence, "second", &clock, true);
        assert!(first.start().unwrap());
        first.release().unwrap();
        assert!(second.try_acquire_or_extend().unwrap());
        assert_eq!(second.active_clients().unwrap(), vec!["second".to_string()]);
    }
}
