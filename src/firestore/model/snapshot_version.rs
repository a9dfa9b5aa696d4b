use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// A backend commit time. `SnapshotVersion::none()` means "never observed".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn none() -> Self {
        Self(Timestamp::default())
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::from_micros(micros))
    }

    pub fn is_none(&self) -> bool {
        *self == Self::none()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn to_micros(&self) -> i64 {
        self.0.to_micros()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({}.{:09})", self.0.seconds, self.0.nanos)
    }
}
