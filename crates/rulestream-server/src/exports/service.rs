//! Export service: the single entry point handlers talk to.
//!
//! Holds the queue, the fact store, the search backends and the delivery
//! mode, constructed once at startup and shared through the router state.

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use futures_util::StreamExt;
use rulestream_core::{CoreError, CsvParameters, Fact, FactId, FactParameters, SearchSpec, UserRef};
use rulestream_storage::DynFactStore;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ExportsConfig;

use super::backends::SearchBackends;
use super::delivery::{DeliveryMode, attachment_response};
use super::error::ExportError;
use super::job::{ExportJob, ExportRequest, ExportSource, slugify};
use super::pipeline::StreamedExport;
use super::queue::{Admission, DeleteOutcome, ExportQueue, SearchTarget};
use super::sink::{BodyChunk, HttpSink};

pub struct ExportService {
    queue: Arc<ExportQueue>,
    facts: DynFactStore,
    backends: Arc<SearchBackends>,
    config: ExportsConfig,
    delivery: DeliveryMode,
}

impl std::fmt::Debug for ExportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportService")
            .field("queue", &self.queue)
            .field("backends", &self.backends)
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

impl ExportService {
    pub fn new(
        queue: Arc<ExportQueue>,
        facts: DynFactStore,
        backends: Arc<SearchBackends>,
        config: ExportsConfig,
    ) -> Self {
        let delivery = DeliveryMode::from_config(&config);
        Self {
            queue,
            facts,
            backends,
            config,
            delivery,
        }
    }

    pub fn queue(&self) -> &Arc<ExportQueue> {
        &self.queue
    }

    pub fn config(&self) -> &ExportsConfig {
        &self.config
    }

    /// Resolves fact ids in request order, dropping duplicates.
    ///
    /// Unknown ids are skipped with a warning, or rejected when strict
    /// resolution is configured. Nothing left to export is `NoFactFound`.
    pub async fn resolve_facts(&self, ids: &[FactId]) -> Result<Vec<Fact>, ExportError> {
        let mut seen = HashSet::new();
        let unique: Vec<FactId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let facts = self.facts.get_facts(&unique).await?;
        if facts.len() < unique.len() {
            let found: HashSet<FactId> = facts.iter().map(|f| f.id).collect();
            let missing: Vec<FactId> = unique.into_iter().filter(|id| !found.contains(id)).collect();
            if self.config.strict_fact_resolution {
                return Err(ExportError::UnknownFacts(missing));
            }
            tracing::warn!(missing = ?missing, "Skipping unknown facts");
        }

        if facts.is_empty() {
            return Err(ExportError::NoFactFound);
        }
        Ok(facts)
    }

    pub async fn queue_fact_export(
        &self,
        ids: &[FactId],
        title: &str,
        csv: CsvParameters,
        user: UserRef,
        parameters: FactParameters,
        streaming: bool,
    ) -> Result<Admission, ExportError> {
        precheck_fact_request(ids, title, &csv)?;
        let facts = self.resolve_facts(ids).await?;
        self.queue
            .add_to_queue(facts, title, csv, user, parameters, streaming)
    }

    /// Admits a custom search export. The backend must exist and have export
    /// activated, checked before anything else about the request.
    pub async fn queue_custom_export(
        &self,
        title: &str,
        target: SearchTarget,
        search_requests: Vec<SearchSpec>,
        csv: CsvParameters,
        user: UserRef,
        streaming: bool,
    ) -> Result<Admission, ExportError> {
        self.backends.exportable(&target.backend)?;
        if search_requests.len() > self.config.max_search_requests {
            return Err(ExportError::TooManySearchRequests {
                count: search_requests.len(),
                max: self.config.max_search_requests,
            });
        }
        self.queue
            .add_to_queue_custom(title, target, search_requests, csv, user, streaming)
    }

    /// Runs a fact export straight into a chunked response, bypassing the queue.
    ///
    /// Errors raised before the first chunk become the response; later ones
    /// terminate the body early.
    pub async fn stream_fact_export(
        &self,
        ids: &[FactId],
        title: &str,
        csv: CsvParameters,
        parameters: FactParameters,
        user: &UserRef,
    ) -> Result<Response, ExportError> {
        precheck_fact_request(ids, title, &csv)?;
        let facts = self.resolve_facts(ids).await?;

        let request = ExportRequest {
            title: title.to_string(),
            source: ExportSource::Facts { facts, parameters },
            csv,
            streaming: true,
        };
        request.validate()?;

        let file_name = format!("{}.csv", slugify(&request.title));
        let export = StreamedExport::new(
            request.source.queries(),
            self.backends.fact_backend(),
            request.csv.clone(),
            request.page_size(self.config.batch_size),
        );

        let (tx, mut rx) = mpsc::channel::<BodyChunk>(1);
        let span = tracing::info_span!("streamed_export", title = %request.title, user = %user);
        let task = tokio::spawn(
            async move {
                let mut sink = HttpSink::new(tx);
                let result = export.run(&mut sink).await;
                match &result {
                    Ok(summary) => tracing::info!(
                        rows = summary.rows,
                        bytes = summary.bytes,
                        "Streamed export finished"
                    ),
                    Err(ExportError::BrowserDisconnected) => {
                        tracing::info!("Browser disconnected, streamed export stopped")
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, code = e.code(), "Streamed export failed");
                        sink.abort(e).await;
                    }
                }
                result
            }
            .instrument(span),
        );

        match rx.recv().await {
            Some(Ok(first)) => {
                let body = futures_util::stream::once(async move { Ok(first) })
                    .chain(ReceiverStream::new(rx));
                Ok(attachment_response(Body::from_stream(body), &file_name))
            }
            Some(Err(_)) | None => match task.await {
                Ok(Ok(_)) => Ok(attachment_response(Body::empty(), &file_name)),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ExportError::Task(e.to_string())),
            },
        }
    }

    pub fn user_exports(&self, user: &UserRef) -> Vec<ExportJob> {
        self.queue.user_exports(user)
    }

    pub fn user_export(&self, id: Uuid, user: &UserRef) -> Result<ExportJob, ExportError> {
        self.queue.user_export(id, user).ok_or(ExportError::NotFound)
    }

    pub async fn delete_export(&self, id: Uuid, user: &UserRef) -> DeleteOutcome {
        self.queue.delete_export(id, user).await
    }

    pub async fn download(&self, id: Uuid, user: &UserRef) -> Result<Response, ExportError> {
        let job = self.user_export(id, user)?;
        self.delivery.deliver(&job).await
    }
}

/// Rejects a fact export before any fact is resolved.
fn precheck_fact_request(
    ids: &[FactId],
    title: &str,
    csv: &CsvParameters,
) -> Result<(), ExportError> {
    if title.trim().is_empty() {
        return Err(CoreError::EmptyTitle.into());
    }
    csv.validate()?;
    if ids.is_empty() {
        return Err(CoreError::EmptyFactList.into());
    }
    Ok(())
}
