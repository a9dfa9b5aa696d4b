use std::collections::BTreeSet;

use crate::firestore::core::{LimitType, Query};
use crate::firestore::local::local_documents_view::{DocumentMap, LocalDocumentsView};
use crate::firestore::local::persistence::PersistedState;
use crate::firestore::model::{DocumentKey, DocumentSet, SnapshotVersion};

/// How a query was served from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    /// A configured field index produced the candidates.
    IndexScan,
    /// The target's previous results plus documents changed since it was last
    /// in sync.
    PreviousResults,
    FullScan,
}

/// Chooses the cheapest way to answer a query from the local cache.
#[derive(Clone, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    /// Returns every document whose local view matches `query` (limits are left
    /// to the view) and the strategy that produced them.
    pub fn get_documents_matching_query(
        &self,
        state: &PersistedState,
        documents_view: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> (DocumentMap, QueryStrategy) {
        if let Some(result) = self.perform_query_using_index(state, documents_view, query) {
            return (result, QueryStrategy::IndexScan);
        }
        if let Some(result) = self.perform_query_using_remote_keys(
            state,
            documents_view,
            query,
            last_limbo_free_snapshot_version,
            remote_keys,
        ) {
            return (result, QueryStrategy::PreviousResults);
        }
        let result = documents_view.get_documents_matching_query(state, query, SnapshotVersion::none());
        (result, QueryStrategy::FullScan)
    }

    fn perform_query_using_index(
        &self,
        state: &PersistedState,
        documents_view: &LocalDocumentsView,
        query: &Query,
    ) -> Option<DocumentMap> {
        if query.matches_all_documents() {
            return None;
        }
        let keys = state
            .index_manager
            .get_documents_matching_target(&query.to_target())?;
        Some(documents_view.get_documents_matching_query_for_keys(state, query, keys.iter()))
    }

    fn perform_query_using_remote_keys(
        &self,
        state: &PersistedState,
        documents_view: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> Option<DocumentMap> {
        // A full scan is as cheap when every document of the collection matches.
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_none() {
            return None;
        }

        let previous = documents_view.get_documents_matching_query_for_keys(state, query, remote_keys.iter());
        let mut sorted = DocumentSet::new(query.comparator());
        for document in previous.values() {
            sorted.add(document.clone());
        }
        if needs_refill(query, &sorted, remote_keys, last_limbo_free_snapshot_version) {
            return None;
        }

        let mut result = previous;
        // Documents updated after the target was last in sync may have started matching.
        result.extend(documents_view.get_documents_matching_query(
            state,
            query,
            last_limbo_free_snapshot_version,
        ));
        Some(result)
    }
}

/// Whether a limit query's previous results can no longer be trusted to
/// contain the top documents.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &DocumentSet,
    remote_keys: &BTreeSet<DocumentKey>,
    last_limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if query.limit.is_none() {
        return false;
    }
    // A previously matching document no longer matches.
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > last_limbo_free_snapshot_version
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{FieldFilter, Operator};
    use crate::firestore::model::{
        FieldIndex, FieldPath, IndexSegment, MutableDocument, ResourcePath,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add_doc(state: &mut PersistedState, path: &str, size: i64, version: i64) {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("size").unwrap(), FirestoreValue::from_integer(size));
        let document = MutableDocument::new_found(key(path), SnapshotVersion::from_micros(version), data);
        state.index_manager.update_index_entries(&document);
        state
            .remote_documents
            .set_entry(document, SnapshotVersion::from_micros(version))
            .unwrap();
    }

    fn big_rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).filter(
            FieldFilter::new(
                FieldPath::from_dot_separated("size").unwrap(),
                Operator::GreaterThan,
                FirestoreValue::from_integer(5),
            )
            .unwrap(),
        )
    }

    #[test]
    fn full_scan_without_previous_results() {
        let mut state = PersistedState::default();
        add_doc(&mut state, "rooms/a", 10, 1);
        add_doc(&mut state, "rooms/b", 1, 1);
        let view = LocalDocumentsView::new("");
        let (documents, strategy) = QueryEngine.get_documents_matching_query(
            &state,
            &view,
            &big_rooms(),
            SnapshotVersion::none(),
            &BTreeSet::new(),
        );
        assert_eq!(strategy, QueryStrategy::FullScan);
        assert_eq!(documents.len(), 1);
    }

    #[test]
    fn previous_results_include_newer_documents() {
        let mut state = PersistedState::default();
        add_doc(&mut state, "rooms/a", 10, 1);
        add_doc(&mut state, "rooms/b", 20, 5);
        add_doc(&mut state, "rooms/c", 30, 1);
        let view = LocalDocumentsView::new("");
        let (documents, strategy) = QueryEngine.get_documents_matching_query(
            &state,
            &view,
            &big_rooms(),
            SnapshotVersion::from_micros(2),
            &BTreeSet::from([key("rooms/a")]),
        );
        assert_eq!(strategy, QueryStrategy::PreviousResults);
        // rooms/c is older than the limbo free version and not in the previous results.
        let keys: Vec<_> = documents.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/b")]);
    }

    #[test]
    fn stale_limit_results_fall_back_to_a_full_scan() {
        let mut state = PersistedState::default();
        add_doc(&mut state, "rooms/a", 10, 1);
        add_doc(&mut state, "rooms/b", 20, 5);
        let view = LocalDocumentsView::new("");
        let (_, strategy) = QueryEngine.get_documents_matching_query(
            &state,
            &view,
            &big_rooms().limit_to_first(1),
            SnapshotVersion::from_micros(2),
            &BTreeSet::from([key("rooms/a"), key("rooms/b")]),
        );
        assert_eq!(strategy, QueryStrategy::FullScan);
    }

    #[test]
    fn configured_index_serves_the_query() {
        let mut state = PersistedState::default();
        state.index_manager.configure_field_indexes(
            vec![FieldIndex::new(
                "rooms",
                vec![IndexSegment::ascending(FieldPath::from_dot_separated("size").unwrap())],
            )],
            std::iter::empty(),
        );
        add_doc(&mut state, "rooms/a", 10, 1);
        add_doc(&mut state, "rooms/b", 1, 1);
        let view = LocalDocumentsView::new("");
        let (documents, strategy) = QueryEngine.get_documents_matching_query(
            &state,
            &view,
            &big_rooms(),
            SnapshotVersion::none(),
            &BTreeSet::new(),
        );
        assert_eq!(strategy, QueryStrategy::IndexScan);
        assert_eq!(documents.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/a")]);
    }
}
