use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use papaya::HashMap as PapayaHashMap;
use rulestream_core::{FactId, FactParameters, Hit, lookup_field};
use rulestream_storage::{ExportQuery, HitPage, PageRequest, SearchBackend, StorageError};

/// Search backend answering from preloaded hit lists.
///
/// Fact queries read the hits registered for the fact id and keep only the
/// hits whose fields match every fact parameter. Search queries read the hits
/// registered for the `indices` string; the request body is not interpreted.
#[derive(Debug, Default)]
pub struct InMemorySearchBackend {
    fact_hits: PapayaHashMap<FactId, Vec<Hit>>,
    index_hits: PapayaHashMap<String, Vec<Hit>>,
    /// Origins (`fact:<id>` / `search:<n>`) whose fetches fail
    failing: PapayaHashMap<String, String>,
    page_delay: Option<Duration>,
    fetches: AtomicU64,
}

impl InMemorySearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every page fetch, useful to observe a running export.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = Some(delay);
        self
    }

    pub fn set_fact_hits(&self, id: impl Into<FactId>, hits: Vec<Hit>) {
        self.fact_hits.pin().insert(id.into(), hits);
    }

    pub fn set_index_hits(&self, indices: impl Into<String>, hits: Vec<Hit>) {
        self.index_hits.pin().insert(indices.into(), hits);
    }

    /// Makes every fetch for `origin` fail with an internal error.
    pub fn fail_on(&self, origin: impl Into<String>, message: impl Into<String>) {
        self.failing.pin().insert(origin.into(), message.into());
    }

    /// Number of page fetches served so far, failed ones included.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn matching_hits(&self, query: &ExportQuery) -> Result<Vec<Hit>, StorageError> {
        match query {
            ExportQuery::Fact { fact, parameters } => Ok(self
                .fact_hits
                .pin()
                .get(&fact.id)
                .map(|hits| filter_by_parameters(hits, parameters))
                .unwrap_or_default()),
            ExportQuery::Search { indices, .. } => self
                .index_hits
                .pin()
                .get(indices)
                .cloned()
                .ok_or_else(|| StorageError::index_not_found(indices.clone())),
        }
    }
}

fn filter_by_parameters(hits: &[Hit], parameters: &FactParameters) -> Vec<Hit> {
    hits.iter()
        .filter(|hit| {
            parameters.iter().all(|(key, expected)| {
                lookup_field(hit, key).is_some_and(|value| match value {
                    serde_json::Value::String(s) => s == expected,
                    other => other.to_string() == *expected,
                })
            })
        })
        .cloned()
        .collect()
}

#[async_trait]
impl SearchBackend for InMemorySearchBackend {
    async fn fetch_page(
        &self,
        query: &ExportQuery,
        page: PageRequest,
    ) -> Result<HitPage, StorageError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.page_delay {
            tokio::time::sleep(delay).await;
        }

        let origin = query.origin();
        if let Some(message) = self.failing.pin().get(&origin) {
            tracing::debug!(origin = %origin, "Injected backend failure");
            return Err(StorageError::internal(message.clone()));
        }

        let hits = self.matching_hits(query)?;
        let start = usize::try_from(page.offset).unwrap_or(usize::MAX).min(hits.len());
        let size = usize::try_from(page.size).unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(hits.len());

        Ok(HitPage {
            hits: hits[start..end].to_vec(),
            has_more: end < hits.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulestream_core::{Fact, SearchSpec};
    use serde_json::{Value, json};

    fn hits(values: Vec<Value>) -> Vec<Hit> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn fact_query(id: i64, parameters: FactParameters) -> ExportQuery {
        ExportQuery::Fact {
            fact: Fact::new(id, "f", json!({})),
            parameters,
        }
    }

    #[tokio::test]
    async fn pages_through_fact_hits() {
        let backend = InMemorySearchBackend::new();
        backend.set_fact_hits(1, hits(vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]));

        let query = fact_query(1, FactParameters::new());
        let first = backend
            .fetch_page(&query, PageRequest::new(0, 2))
            .await
            .unwrap();
        assert_eq!(first.hits.len(), 2);
        assert!(first.has_more);

        let second = backend
            .fetch_page(&query, PageRequest::new(2, 2))
            .await
            .unwrap();
        assert_eq!(second.hits.len(), 1);
        assert!(!second.has_more);
        assert_eq!(backend.fetch_count(), 2);
    }

    #[tokio::test]
    async fn fact_parameters_filter_hits() {
        let backend = InMemorySearchBackend::new();
        backend.set_fact_hits(
            1,
            hits(vec![
                json!({"site": "paris", "n": 1}),
                json!({"site": "lyon", "n": 2}),
            ]),
        );

        let mut parameters = FactParameters::new();
        parameters.insert("site".into(), "lyon".into());
        let page = backend
            .fetch_page(&fact_query(1, parameters), PageRequest::new(0, 10))
            .await
            .unwrap();
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0]["n"], json!(2));
    }

    #[tokio::test]
    async fn unknown_index_and_injected_failures() {
        let backend = InMemorySearchBackend::new();
        let query = ExportQuery::Search {
            indices: "missing".into(),
            request: SearchSpec::new(json!({})),
            position: 0,
        };
        let err = backend
            .fetch_page(&query, PageRequest::new(0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::IndexNotFound { .. }));

        backend.set_fact_hits(7, hits(vec![json!({"n": 1})]));
        backend.fail_on("fact:7", "shard failure");
        let err = backend
            .fetch_page(&fact_query(7, FactParameters::new()), PageRequest::new(0, 10))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Internal error: shard failure");
    }
}
