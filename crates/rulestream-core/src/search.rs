use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One raw search request of a custom export.
///
/// The body is passed untouched to the search backend; rulestream does not plan queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpec {
    pub body: Value,
}

impl SearchSpec {
    pub fn new(body: Value) -> Self {
        Self { body }
    }
}
