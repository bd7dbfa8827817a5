//! Search results as they flow through the export pipeline.

use serde_json::{Map, Value};

/// One result row: the source document of a search hit.
pub type Hit = Map<String, Value>;

/// A page of hits produced for one fact or search request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HitBatch {
    /// Where the batch came from, e.g. `fact:12` or `search:0`; used in logs
    pub origin: String,
    pub hits: Vec<Hit>,
}

impl HitBatch {
    pub fn new(origin: impl Into<String>, hits: Vec<Hit>) -> Self {
        Self {
            origin: origin.into(),
            hits,
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Resolves a column path against a hit.
///
/// An exact key match wins; otherwise the path is split on `.` and walked
/// through nested objects.
pub fn lookup_field<'a>(hit: &'a Hit, path: &str) -> Option<&'a Value> {
    if let Some(value) = hit.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut current = hit.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}
