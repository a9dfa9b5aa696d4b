use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::DocumentKey;

pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default_database(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// Key that scopes persisted state and shared-store entries to this database.
    pub fn persistence_key(&self) -> String {
        format!("{}.{}", self.project_id, self.database)
    }

    /// Fully qualified resource name of `key`, as hashed into existence filters.
    pub fn document_path(&self, key: &DocumentKey) -> String {
        format!("{self}/documents/{}", key.path().canonical_string())
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/databases/{}", self.project_id, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_key_includes_database() {
        let id = DatabaseId::default_database("chat");
        assert!(id.is_default_database());
        assert_eq!(id.persistence_key(), "chat.(default)");
        assert_eq!(id.to_string(), "projects/chat/databases/(default)");
    }
}
