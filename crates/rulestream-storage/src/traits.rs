//! Storage traits consumed by the export core.

use async_trait::async_trait;
use rulestream_core::{Fact, FactId};

use crate::error::StorageError;
use crate::types::{ExportQuery, HitPage, PageRequest};

/// Resolves fact definitions.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Reads a fact by id.
    ///
    /// Returns `None` if the fact does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues, not for missing facts.
    async fn get_fact(&self, id: FactId) -> Result<Option<Fact>, StorageError>;

    /// Reads several facts, preserving the order of `ids` and skipping unknown ones.
    async fn get_facts(&self, ids: &[FactId]) -> Result<Vec<Fact>, StorageError> {
        let mut facts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(fact) = self.get_fact(*id).await? {
                facts.push(fact);
            }
        }
        Ok(facts)
    }
}

/// Executes export queries page by page.
///
/// Implementations must be thread-safe: one backend instance serves every
/// concurrently running export.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Fetches one page of hits for `query`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidQuery` or `IndexNotFound` for queries the
    /// backend cannot run, `ConnectionError` when it is unreachable.
    async fn fetch_page(
        &self,
        query: &ExportQuery,
        page: PageRequest,
    ) -> Result<HitPage, StorageError>;
}
