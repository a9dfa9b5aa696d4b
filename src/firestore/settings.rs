//! Client settings.
//!
//! Values are validated when set, so a `FirestoreSettings` that exists is always
//! usable by the client.

use std::path::PathBuf;
use std::time::Duration;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::util::backoff::BackoffSettings;

/// Default cap on limbo documents resolved at the same time.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
/// How often the primary client refreshes its lease (4 seconds).
pub const DEFAULT_LEASE_REFRESH_INTERVAL: Duration = Duration::from_secs(4);
/// Age after which a lease that was not refreshed may be taken over (5 seconds).
pub const DEFAULT_MAX_PRIMARY_LEASE_AGE: Duration = Duration::from_secs(5);

/// Where the local cache lives.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum PersistenceSettings {
    /// Cache kept in memory only and garbage collected eagerly.
    #[default]
    Memory,
    /// Cache serialized as JSON to `path` after every committed transaction.
    File { path: PathBuf },
}

impl PersistenceSettings {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        PersistenceSettings::File { path: path.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    persistence: PersistenceSettings,
    synchronize_tabs: bool,
    force_ownership: bool,
    max_concurrent_limbo_resolutions: usize,
    lease_refresh_interval: Duration,
    max_primary_lease_age: Duration,
    backoff: BackoffSettings,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            persistence: PersistenceSettings::Memory,
            synchronize_tabs: false,
            force_ownership: false,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            lease_refresh_interval: DEFAULT_LEASE_REFRESH_INTERVAL,
            max_primary_lease_age: DEFAULT_MAX_PRIMARY_LEASE_AGE,
            backoff: BackoffSettings::default(),
        }
    }
}

impl FirestoreSettings {
    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    /// Allows several clients to share one persistence and elect a primary.
    pub fn with_synchronize_tabs(mut self, synchronize_tabs: bool) -> Self {
        self.synchronize_tabs = synchronize_tabs;
        self
    }

    /// Takes the primary lease even while another client holds a valid one.
    pub fn with_force_ownership(mut self, force_ownership: bool) -> Self {
        self.force_ownership = force_ownership;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, value: usize) -> FirestoreResult<Self> {
        if value == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        self.max_concurrent_limbo_resolutions = value;
        Ok(self)
    }

    pub fn with_lease_timing(
        mut self,
        refresh_interval: Duration,
        max_lease_age: Duration,
    ) -> FirestoreResult<Self> {
        validate_lease_timing(refresh_interval, max_lease_age)?;
        self.lease_refresh_interval = refresh_interval;
        self.max_primary_lease_age = max_lease_age;
        Ok(self)
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> FirestoreResult<Self> {
        if backoff.backoff_factor < 1.0 {
            return Err(invalid_argument("backoff_factor must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            return Err(invalid_argument("jitter_factor must be between 0 and 1"));
        }
        if backoff.initial_delay_millis > backoff.max_delay_millis {
            return Err(invalid_argument(
                "initial_delay_millis cannot exceed max_delay_millis",
            ));
        }
        self.backoff = backoff;
        Ok(self)
    }

    pub fn persistence(&self) -> &PersistenceSettings {
        &self.persistence
    }

    pub fn synchronize_tabs(&self) -> bool {
        self.synchronize_tabs
    }

    pub fn force_ownership(&self) -> bool {
        self.force_ownership
    }

    pub fn max_concurrent_limbo_resolutions(&self) -> usize {
        self.max_concurrent_limbo_resolutions
    }

    pub fn lease_refresh_interval(&self) -> Duration {
        self.lease_refresh_interval
    }

    pub fn max_primary_lease_age(&self) -> Duration {
        self.max_primary_lease_age
    }

    pub fn backoff(&self) -> BackoffSettings {
        self.backoff
    }
}

fn validate_lease_timing(refresh_interval: Duration, max_lease_age: Duration) -> FirestoreResult<()> {
    if refresh_interval.is_zero() {
        return Err(invalid_argument("lease_refresh_interval must be greater than zero"));
    }
    if refresh_interval >= max_lease_age {
        return Err(invalid_argument(
            "lease_refresh_interval must be shorter than max_primary_lease_age",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = FirestoreSettings::default();
        assert_eq!(settings.persistence(), &PersistenceSettings::Memory);
        assert_eq!(settings.max_concurrent_limbo_resolutions(), 100);
        assert_eq!(settings.lease_refresh_interval(), Duration::from_secs(4));
        assert_eq!(settings.max_primary_lease_age(), Duration::from_secs(5));
        assert!(!settings.synchronize_tabs());
    }

    #[test]
    fn rejects_invalid_values() {
        let err = FirestoreSettings::default()
            .with_max_concurrent_limbo_resolutions(0)
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");

        assert!(FirestoreSettings::default()
            .with_lease_timing(Duration::from_secs(5), Duration::from_secs(5))
            .is_err());

        let backoff = BackoffSettings {
            backoff_factor: 0.5,
            ..BackoffSettings::default()
        };
        assert!(FirestoreSettings::default().with_backoff(backoff).is_err());
    }
}
