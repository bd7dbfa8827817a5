//! Delivery of finished export artifacts.

use std::path::PathBuf;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;

use crate::config::ExportsConfig;

use super::error::ExportError;
use super::job::{ExportJob, ExportStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Stream the artifact from local disk in `chunk_size` pieces.
    Direct {
        export_path: PathBuf,
        chunk_size: usize,
    },
    /// Redirect to `<base_url>/<file name>` served elsewhere.
    Indirect { base_url: String },
}

impl DeliveryMode {
    pub fn from_config(cfg: &ExportsConfig) -> Self {
        match (&cfg.indirect_download_url, cfg.direct_download) {
            (Some(url), false) => DeliveryMode::Indirect {
                base_url: url.trim_end_matches('/').to_string(),
            },
            _ => DeliveryMode::Direct {
                export_path: cfg.export_path.clone(),
                chunk_size: cfg.download_chunk_size,
            },
        }
    }

    /// Builds the download response for a job the caller may see.
    ///
    /// Anything but a Completed job with an artifact is `NotFound`.
    pub async fn deliver(&self, job: &ExportJob) -> Result<Response, ExportError> {
        let file_name = match (job.status, job.file_name.as_deref()) {
            (ExportStatus::Completed, Some(name)) => name,
            _ => return Err(ExportError::NotFound),
        };

        match self {
            DeliveryMode::Indirect { base_url } => {
                let location = format!("{base_url}/{file_name}");
                tracing::debug!(job_id = %job.id, location = %location, "Redirecting export download");
                Ok(Redirect::permanent(&location).into_response())
            }
            DeliveryMode::Direct {
                export_path,
                chunk_size,
            } => {
                let path = export_path.join(file_name);
                let file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!(job_id = %job.id, path = %path.display(), "Export artifact missing");
                        return Err(ExportError::NotFound);
                    }
                    Err(e) => return Err(e.into()),
                };

                let job_id = job.id;
                let stream = ReaderStream::with_capacity(file, *chunk_size).map(move |chunk| {
                    if let Err(e) = &chunk {
                        tracing::warn!(job_id = %job_id, error = %e, "Export download aborted");
                    }
                    chunk
                });
                Ok(attachment_response(Body::from_stream(stream), file_name))
            }
        }
    }
}

/// Chunked `application/octet-stream` response offered as a file download.
pub fn attachment_response(body: Body, file_name: &str) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let disposition = format!("attachment; filename=\"{}\"", file_name.replace('"', ""));
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exports::job::{ExportRequest, ExportSource};
    use rulestream_core::{CsvParameters, Fact, FactParameters, UserRef};
    use serde_json::json;

    fn completed_job(file_name: &str) -> ExportJob {
        let request = ExportRequest {
            title: "T".into(),
            source: ExportSource::Facts {
                facts: vec![Fact::new(1, "f", json!({}))],
                parameters: FactParameters::new(),
            },
            csv: CsvParameters::default(),
            streaming: true,
        };
        let mut job = ExportJob::new(request, "fp".into(), UserRef::new("u1"));
        job.transition(ExportStatus::Running).unwrap();
        job.transition(ExportStatus::Completed).unwrap();
        job.file_name = Some(file_name.to_string());
        job
    }

    #[tokio::test]
    async fn indirect_mode_redirects_permanently() {
        let mode = DeliveryMode::Indirect {
            base_url: "https://files.example.com/exports".into(),
        };
        let resp = mode.deliver(&completed_job("t_1.csv")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://files.example.com/exports/t_1.csv"
        );
    }

    #[tokio::test]
    async fn direct_mode_streams_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("t_1.csv"), b"a,b\n1,2\n").await.unwrap();
        let mode = DeliveryMode::Direct {
            export_path: dir.path().to_path_buf(),
            chunk_size: 3,
        };

        let resp = mode.deliver(&completed_job("t_1.csv")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"t_1.csv\""
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn missing_artifact_or_unfinished_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mode = DeliveryMode::Direct {
            export_path: dir.path().to_path_buf(),
            chunk_size: 1024,
        };
        assert!(matches!(
            mode.deliver(&completed_job("gone.csv")).await,
            Err(ExportError::NotFound)
        ));

        let mut running = completed_job("t.csv");
        running.status = ExportStatus::Running;
        assert!(matches!(mode.deliver(&running).await, Err(ExportError::NotFound)));
    }

    #[test]
    fn mode_from_config() {
        let mut cfg = ExportsConfig::default();
        assert!(matches!(DeliveryMode::from_config(&cfg), DeliveryMode::Direct { .. }));
        cfg.direct_download = false;
        cfg.indirect_download_url = Some("https://cdn.example.com/x/".into());
        assert_eq!(
            DeliveryMode::from_config(&cfg),
            DeliveryMode::Indirect {
                base_url: "https://cdn.example.com/x".into()
            }
        );
    }
}
