//! CSV encoding of hit batches.

use rulestream_core::{CsvColumn, CsvParameters, Hit, lookup_field};
use serde_json::Value;

use super::error::ExportError;

/// Encodes one batch. The header line is written only when `first` is true.
///
/// Columns are separated by `params.separator`; array cells are joined with
/// `params.list_separator`. Missing and null fields become empty cells,
/// nested objects are written as compact JSON.
pub fn encode_batch(
    hits: &[Hit],
    columns: &[CsvColumn],
    params: &CsvParameters,
    first: bool,
) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(params.delimiter())
        .has_headers(false)
        .from_writer(Vec::new());

    if first {
        writer.write_record(columns.iter().map(CsvColumn::header))?;
    }
    for hit in hits {
        writer.write_record(
            columns
                .iter()
                .map(|column| cell(lookup_field(hit, &column.name), params.list_separator)),
        )?;
    }

    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))
}

fn cell(value: Option<&Value>, list_separator: char) -> String {
    match value {
        None => String::new(),
        Some(Value::Array(items)) => {
            let mut out = String::new();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(list_separator);
                }
                out.push_str(&scalar(item));
            }
            out
        }
        Some(other) => scalar(other),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Stateful wrapper used by one pipeline run: fixes the column set and
/// tracks whether the header was written.
#[derive(Debug)]
pub struct CsvEncoder {
    params: CsvParameters,
    columns: Vec<CsvColumn>,
    header_written: bool,
}

impl CsvEncoder {
    pub fn new(params: CsvParameters) -> Self {
        let columns = params.columns.clone();
        Self {
            params,
            columns,
            header_written: false,
        }
    }

    /// Encodes a batch, emitting the header with the first non-empty one.
    ///
    /// Without explicit columns the keys of the first hit become the columns
    /// for the whole export.
    pub fn encode(&mut self, hits: &[Hit]) -> Result<Vec<u8>, ExportError> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        if self.columns.is_empty() {
            self.columns = hits[0].keys().map(CsvColumn::new).collect();
        }
        let first = !self.header_written;
        let bytes = encode_batch(hits, &self.columns, &self.params, first)?;
        self.header_written = true;
        Ok(bytes)
    }

    /// Header-only output for an export that produced no rows, when the
    /// columns are known up front.
    pub fn finish(&mut self) -> Result<Vec<u8>, ExportError> {
        if self.header_written || self.columns.is_empty() {
            return Ok(Vec::new());
        }
        self.header_written = true;
        encode_batch(&[], &self.columns, &self.params, true)
    }
}
