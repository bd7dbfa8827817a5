use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a fact definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactId(pub i64);

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for FactId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Named parameter values substituted into every fact of one export.
///
/// A `BTreeMap` keeps iteration order stable, which the export fingerprint relies on.
pub type FactParameters = BTreeMap<String, String>;

/// A named, parameterized query definition executed against a search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    pub id: FactId,
    pub name: String,
    /// Backend-specific query body
    #[serde(default)]
    pub query: Value,
}

impl Fact {
    pub fn new(id: impl Into<FactId>, name: impl Into<String>, query: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            query,
        }
    }
}
