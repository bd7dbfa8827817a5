//! Producer/consumer pipeline turning export queries into CSV chunks.
//!
//! The producer fetches pages for each query strictly in order and sends them
//! over a channel of capacity one, so it is never more than one batch ahead of
//! the consumer. The consumer encodes each batch and writes it to a
//! [`ChunkSink`]. Both sides observe a single cancellation token, which is
//! triggered by the caller (client disconnect, delete-while-running) or by
//! whichever side fails first. The first failure is recorded once and read
//! only after both sides have been joined.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use rulestream_core::{CsvParameters, HitBatch};
use rulestream_storage::{DynSearchBackend, ExportQuery, PageRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::encoder::CsvEncoder;
use super::error::ExportError;
use super::sink::ChunkSink;

/// Called with the completed fraction after each query.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub batches: u64,
    pub rows: u64,
    pub bytes: u64,
}

/// One export execution. Consumed by [`StreamedExport::run`].
pub struct StreamedExport {
    queries: Vec<ExportQuery>,
    backend: DynSearchBackend,
    csv: CsvParameters,
    page_size: u64,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for StreamedExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedExport")
            .field("queries", &self.queries.len())
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Holds the first error reported by either side.
#[derive(Default)]
struct FirstError(OnceLock<ExportError>);

impl FirstError {
    fn record(&self, err: ExportError) {
        if let Err(later) = self.0.set(err) {
            tracing::debug!(error = %later, "Additional pipeline error ignored");
        }
    }

    fn into_inner(self) -> Option<ExportError> {
        self.0.into_inner()
    }
}

impl StreamedExport {
    pub fn new(
        queries: Vec<ExportQuery>,
        backend: DynSearchBackend,
        csv: CsvParameters,
        page_size: u64,
    ) -> Self {
        Self {
            queries,
            backend,
            csv,
            page_size: page_size.max(1),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Cancels the run when `token` is cancelled. Internal failures cancel a
    /// child token and leave `token` untouched.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs producer and consumer to completion.
    ///
    /// Returns [`ExportError::Canceled`] when the external token fired, the
    /// first recorded error when a side failed, the summary otherwise.
    pub async fn run<S: ChunkSink>(self, sink: &mut S) -> Result<PipelineSummary, ExportError> {
        let token = self.cancel.child_token();
        let failure = FirstError::default();
        let (data_tx, data_rx) = mpsc::channel::<HitBatch>(1);

        let producer = produce(
            &self.queries,
            &self.backend,
            self.page_size,
            self.csv.row_limit(),
            data_tx,
            &token,
            &failure,
            self.progress.as_ref(),
        );
        let consumer = consume(data_rx, sink, self.csv.clone(), &token, &failure);

        let (batches, (rows, bytes)) = tokio::join!(producer, consumer);

        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(ExportError::Canceled);
        }
        Ok(PipelineSummary {
            batches,
            rows,
            bytes,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn produce(
    queries: &[ExportQuery],
    backend: &DynSearchBackend,
    page_size: u64,
    row_limit: Option<u64>,
    data_tx: mpsc::Sender<HitBatch>,
    token: &CancellationToken,
    failure: &FirstError,
    progress: Option<&ProgressFn>,
) -> u64 {
    let total = queries.len();
    let mut sent = 0u64;

    for (index, query) in queries.iter().enumerate() {
        let origin = query.origin();
        let mut offset = 0u64;

        loop {
            if token.is_cancelled() {
                return sent;
            }
            let size = match row_limit {
                Some(limit) => limit.saturating_sub(offset).min(page_size),
                None => page_size,
            };
            if size == 0 {
                break;
            }

            let page = tokio::select! {
                biased;
                _ = token.cancelled() => return sent,
                page = backend.fetch_page(query, PageRequest::new(offset, size)) => page,
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(
                        origin = %origin,
                        error = %e,
                        category = %e.category(),
                        transient = e.is_transient(),
                        "Export query failed"
                    );
                    failure.record(e.into());
                    token.cancel();
                    return sent;
                }
            };

            let count = page.hits.len() as u64;
            if count > 0 {
                let batch = HitBatch::new(origin.clone(), page.hits);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return sent,
                    res = data_tx.send(batch) => {
                        if res.is_err() {
                            // consumer is gone and recorded why
                            return sent;
                        }
                    }
                }
                sent += 1;
            }
            offset += count;
            if !page.has_more || count == 0 {
                break;
            }
        }

        tracing::debug!(origin = %origin, rows = offset, "Export query finished");
        if let Some(progress) = progress {
            progress((index + 1) as f32 / total as f32);
        }
    }
    sent
}

async fn consume<S: ChunkSink>(
    mut data_rx: mpsc::Receiver<HitBatch>,
    sink: &mut S,
    csv: CsvParameters,
    token: &CancellationToken,
    failure: &FirstError,
) -> (u64, u64) {
    let mut encoder = CsvEncoder::new(csv);
    let mut rows = 0u64;
    let mut bytes = 0u64;

    loop {
        let batch = tokio::select! {
            biased;
            _ = token.cancelled() => return (rows, bytes),
            _ = sink.closed() => {
                tracing::info!("Browser disconnected, stopping export");
                failure.record(ExportError::BrowserDisconnected);
                token.cancel();
                return (rows, bytes);
            }
            batch = data_rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let chunk = match encoder.encode(&batch.hits) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(origin = %batch.origin, error = %e, "CSV encoding failed");
                failure.record(e);
                token.cancel();
                return (rows, bytes);
            }
        };
        rows += batch.len() as u64;
        if let Err(e) = write(sink, chunk, &mut bytes).await {
            failure.record(e);
            token.cancel();
            return (rows, bytes);
        }
    }

    // the producer closed the channel; it may have done so after a failure
    if token.is_cancelled() {
        return (rows, bytes);
    }
    let tail = match encoder.finish() {
        Ok(tail) => tail,
        Err(e) => {
            failure.record(e);
            token.cancel();
            return (rows, bytes);
        }
    };
    if let Err(e) = write(sink, tail, &mut bytes).await {
        failure.record(e);
        token.cancel();
    }
    (rows, bytes)
}

async fn write<S: ChunkSink>(sink: &mut S, chunk: Vec<u8>, bytes: &mut u64) -> Result<(), ExportError> {
    if chunk.is_empty() {
        return Ok(());
    }
    let len = chunk.len() as u64;
    sink.write_chunk(Bytes::from(chunk)).await?;
    *bytes += len;
    Ok(())
}
