//! JSON fixtures for seeding the in-memory backends.
//!
//! ```json
//! {
//!   "facts": [{"id": 1, "name": "alarms", "query": {}}],
//!   "factHits": {"1": [{"site": "paris", "count": 3}]},
//!   "indexHits": {"events-*": [{"type": "door", "tags": ["a", "b"]}]}
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use rulestream_core::{Fact, FactId, Hit};
use serde::Deserialize;
use thiserror::Error;

use crate::{InMemoryFactStore, InMemorySearchBackend};

#[derive(Debug, Error)]
pub enum FixturesError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid fixtures JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixtures {
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub fact_hits: BTreeMap<i64, Vec<Hit>>,
    #[serde(default)]
    pub index_hits: BTreeMap<String, Vec<Hit>>,
}

impl Fixtures {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FixturesError> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Builds both backends from the fixtures.
    pub fn into_backends(self) -> (InMemoryFactStore, InMemorySearchBackend) {
        let store = InMemoryFactStore::with_facts(self.facts);
        let backend = InMemorySearchBackend::new();
        for (id, hits) in self.fact_hits {
            backend.set_fact_hits(FactId(id), hits);
        }
        for (indices, hits) in self.index_hits {
            backend.set_index_hits(indices, hits);
        }
        tracing::info!(facts = store.len(), "In-memory backends seeded from fixtures");
        (store, backend)
    }
}
