use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The authenticated principal that owns a mutation queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Storage key for per-user state. Unauthenticated users share the empty key.
    pub fn key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => f.write_str("User(anonymous)"),
        }
    }
}
