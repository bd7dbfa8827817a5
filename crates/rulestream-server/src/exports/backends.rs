use std::collections::BTreeMap;
use std::fmt;

use rulestream_storage::DynSearchBackend;

use super::error::ExportError;
use super::job::ExportSource;

/// A configured search backend usable by custom exports.
#[derive(Clone)]
pub struct NamedBackend {
    pub export_activated: bool,
    pub backend: DynSearchBackend,
}

/// Search backends known to the export core: the one facts run against and
/// the named ones custom exports may target.
#[derive(Clone)]
pub struct SearchBackends {
    facts: DynSearchBackend,
    named: BTreeMap<String, NamedBackend>,
}

impl fmt::Debug for SearchBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let named: Vec<(&String, bool)> = self
            .named
            .iter()
            .map(|(name, b)| (name, b.export_activated))
            .collect();
        f.debug_struct("SearchBackends")
            .field("named", &named)
            .finish_non_exhaustive()
    }
}

impl SearchBackends {
    pub fn new(facts: DynSearchBackend) -> Self {
        Self {
            facts,
            named: BTreeMap::new(),
        }
    }

    pub fn with_backend(
        mut self,
        name: impl Into<String>,
        backend: DynSearchBackend,
        export_activated: bool,
    ) -> Self {
        self.named.insert(
            name.into(),
            NamedBackend {
                export_activated,
                backend,
            },
        );
        self
    }

    pub fn fact_backend(&self) -> DynSearchBackend {
        self.facts.clone()
    }

    /// Backend `name` if it exists and has export enabled.
    pub fn exportable(&self, name: &str) -> Result<DynSearchBackend, ExportError> {
        let named = self
            .named
            .get(name)
            .ok_or_else(|| ExportError::UnknownBackend(name.to_string()))?;
        if !named.export_activated {
            return Err(ExportError::ExportDisabled(name.to_string()));
        }
        Ok(named.backend.clone())
    }

    pub fn for_source(&self, source: &ExportSource) -> Result<DynSearchBackend, ExportError> {
        match source {
            ExportSource::Facts { .. } => Ok(self.fact_backend()),
            ExportSource::Custom { backend, .. } => self.exportable(backend),
        }
    }
}
