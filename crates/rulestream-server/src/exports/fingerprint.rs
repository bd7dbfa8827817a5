//! Deduplication key of an export request.
//!
//! Two requests share a fingerprint when they would produce the same file:
//! same sorted, de-duplicated fact ids (or same indices, search requests and
//! backend), same title, CSV parameters, fact parameters and fetch mode.
//! Object keys inside search request bodies are sorted before hashing so key
//! order in the client JSON does not matter.

use rulestream_core::FactId;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use super::job::{ExportRequest, ExportSource};

pub fn fingerprint(request: &ExportRequest) -> String {
    let source = match &request.source {
        ExportSource::Facts { facts, parameters } => {
            let mut ids: Vec<FactId> = facts.iter().map(|f| f.id).collect();
            ids.sort_unstable();
            ids.dedup();
            json!({ "facts": ids, "parameters": parameters })
        }
        ExportSource::Custom {
            indices,
            search_requests,
            backend,
        } => json!({
            "indices": indices,
            "searchRequests": search_requests,
            "backend": backend,
        }),
    };
    let input = json!({
        "source": source,
        "title": request.title,
        "csv": request.csv,
        "streaming": request.streaming,
    });

    let canonical = canonicalize(input).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect::<Map<_, _>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulestream_core::{CsvParameters, Fact, FactParameters, SearchSpec};

    fn facts_request(ids: &[i64], title: &str) -> ExportRequest {
        ExportRequest {
            title: title.into(),
            source: ExportSource::Facts {
                facts: ids.iter().map(|id| Fact::new(*id, "f", json!({}))).collect(),
                parameters: FactParameters::new(),
            },
            csv: CsvParameters::default(),
            streaming: true,
        }
    }

    fn custom_request(body: Value) -> ExportRequest {
        ExportRequest {
            title: "search".into(),
            source: ExportSource::Custom {
                indices: "events-*".into(),
                search_requests: vec![SearchSpec::new(body)],
                backend: "main".into(),
            },
            csv: CsvParameters::default(),
            streaming: true,
        }
    }

    #[test]
    fn fact_order_and_duplicates_do_not_matter() {
        assert_eq!(
            fingerprint(&facts_request(&[2, 1, 2], "T")),
            fingerprint(&facts_request(&[1, 2], "T"))
        );
    }

    #[test]
    fn title_and_parameters_matter() {
        let base = fingerprint(&facts_request(&[1, 2], "T"));
        assert_ne!(base, fingerprint(&facts_request(&[1, 2], "U")));

        let mut other_csv = facts_request(&[1, 2], "T");
        other_csv.csv = CsvParameters::new(';', '|');
        assert_ne!(base, fingerprint(&other_csv));

        let mut not_streaming = facts_request(&[1, 2], "T");
        not_streaming.streaming = false;
        assert_ne!(base, fingerprint(&not_streaming));

        let mut with_params = facts_request(&[1, 2], "T");
        if let ExportSource::Facts { parameters, .. } = &mut with_params.source {
            parameters.insert("site".into(), "paris".into());
        }
        assert_ne!(base, fingerprint(&with_params));
    }

    #[test]
    fn search_body_key_order_is_ignored() {
        let a = custom_request(json!({"size": 10, "query": {"term": {"a": 1}}}));
        let b = custom_request(json!({"query": {"term": {"a": 1}}, "size": 10}));
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = custom_request(json!({"query": {"term": {"a": 2}}, "size": 10}));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }
}
