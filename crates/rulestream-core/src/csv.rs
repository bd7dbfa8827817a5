//! CSV output parameters carried by every export request.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

fn default_separator() -> char {
    ','
}

fn default_list_separator() -> char {
    ';'
}

/// Request-scoped CSV settings.
///
/// `separator` splits columns and `list_separator` joins the elements of a
/// list-valued cell. Using the same character for both would make the output
/// ambiguous, so [`CsvParameters::validate`] rejects that before any work is
/// admitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvParameters {
    #[serde(default = "default_separator")]
    pub separator: char,
    #[serde(default = "default_list_separator")]
    pub list_separator: char,
    /// Maximum rows per fact or search request, 0 means unlimited
    #[serde(default)]
    pub limit: u64,
    /// Explicit column selection. When empty the columns of the first hit are used.
    #[serde(default)]
    pub columns: Vec<CsvColumn>,
}

impl Default for CsvParameters {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            list_separator: default_list_separator(),
            limit: 0,
            columns: Vec::new(),
        }
    }
}

impl CsvParameters {
    pub fn new(separator: char, list_separator: char) -> Self {
        Self {
            separator,
            list_separator,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_columns(mut self, columns: Vec<CsvColumn>) -> Self {
        self.columns = columns;
        self
    }

    /// Checks the separator rules shared by every export entry point.
    pub fn validate(&self) -> Result<()> {
        if self.separator == self.list_separator {
            return Err(CoreError::SeparatorConflict(self.separator));
        }
        for sep in [self.separator, self.list_separator] {
            if !is_valid_separator(sep) {
                return Err(CoreError::InvalidSeparator(sep));
            }
        }
        Ok(())
    }

    /// Column delimiter as a byte. Only meaningful after [`validate`](Self::validate).
    pub fn delimiter(&self) -> u8 {
        self.separator as u8
    }

    /// `None` when `limit` is 0.
    pub fn row_limit(&self) -> Option<u64> {
        (self.limit > 0).then_some(self.limit)
    }
}

fn is_valid_separator(c: char) -> bool {
    (c.is_ascii_graphic() || c == ' ' || c == '\t') && c != '"'
}

/// One output column: a (possibly dotted) field path and an optional header label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CsvColumn {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl CsvColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
        }
    }

    pub fn labeled(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: Some(label.into()),
        }
    }

    /// Text written in the header row.
    pub fn header(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}
