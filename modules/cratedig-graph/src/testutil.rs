//! Helpers for tests that need a real store without a database file.

use crate::store::GraphStore;

/// In-memory SQLite store with the schema applied.
pub async fn memory_store() -> GraphStore {
    let store = GraphStore::connect_in_memory()
        .await
        .expect("open in-memory store");
    store.migrate().await.expect("apply schema");
    store
}
