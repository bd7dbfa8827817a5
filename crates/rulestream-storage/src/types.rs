use rulestream_core::{Fact, FactParameters, Hit, SearchSpec};

/// What one producer step asks the backend for.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportQuery {
    /// Execute a fact definition with the export's parameters.
    Fact {
        fact: Fact,
        parameters: FactParameters,
    },
    /// Execute the `position`-th raw search request of a custom export.
    Search {
        indices: String,
        request: SearchSpec,
        position: usize,
    },
}

impl ExportQuery {
    /// Short label used to tag batches and log lines.
    pub fn origin(&self) -> String {
        match self {
            ExportQuery::Fact { fact, .. } => format!("fact:{}", fact.id),
            ExportQuery::Search { position, .. } => format!("search:{position}"),
        }
    }
}

/// Offset-based page selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u64,
    pub size: u64,
}

impl PageRequest {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }
}

/// One page of hits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HitPage {
    pub hits: Vec<Hit>,
    /// `false` once the backend has no hits beyond this page
    pub has_more: bool,
}
