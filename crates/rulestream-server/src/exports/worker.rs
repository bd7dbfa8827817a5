//! Background execution of queued exports.
//!
//! A dispatcher receives admitted job ids in admission order and runs each
//! one under a semaphore permit. A job writes to `<file>.partial` and is
//! renamed to its final name only after the pipeline succeeded; canceled and
//! failed runs remove the partial file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::backends::SearchBackends;
use super::error::ExportError;
use super::pipeline::{PipelineSummary, StreamedExport};
use super::queue::{ExportQueue, RunTicket, remove_artifact};
use super::sink::FileSink;

#[derive(Debug, Clone)]
pub struct ExportWorker {
    queue: Arc<ExportQueue>,
    backends: Arc<SearchBackends>,
    batch_size: u64,
}

impl ExportWorker {
    pub fn new(queue: Arc<ExportQueue>, backends: Arc<SearchBackends>, batch_size: u64) -> Self {
        Self {
            queue,
            backends,
            batch_size,
        }
    }

    /// Spawns the dispatcher. It stops when `shutdown` fires or when the
    /// queue is dropped; running jobs are then canceled and awaited.
    pub fn spawn(
        self,
        mut jobs: mpsc::UnboundedReceiver<Uuid>,
        max_concurrent_jobs: usize,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(max_concurrent_jobs.max(1)));
        tokio::spawn(async move {
            let mut running: JoinSet<()> = JoinSet::new();
            loop {
                let id = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(_) = running.join_next(), if !running.is_empty() => continue,
                    id = jobs.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let worker = self.clone();
                running.spawn(async move {
                    let _permit = permit;
                    worker.supervise(id).await;
                });
            }

            if !running.is_empty() {
                let canceled = self.queue.cancel_running();
                tracing::info!(jobs = running.len(), canceled, "Draining export jobs");
                while running.join_next().await.is_some() {}
            }
            tracing::debug!("Export dispatcher stopped");
        })
    }

    /// Runs the job in its own task so a panic fails the job instead of the
    /// dispatcher.
    async fn supervise(&self, id: Uuid) {
        let task = tokio::spawn({
            let worker = self.clone();
            async move { worker.run_job(id).await }
                .instrument(tracing::info_span!("export_job", job_id = %id))
        });
        if let Err(e) = task.await {
            tracing::error!(job_id = %id, error = %e, "Export task crashed");
            if let Some(final_path) = self.queue.artifact_path(id) {
                remove_artifact(&partial_path(&final_path)).await;
            }
            self.queue.fail(id, format!("export task failed: {e}"));
        }
    }

    /// Runs one job to a terminal state. Jobs deleted before they started are skipped.
    pub async fn run_job(&self, id: Uuid) {
        let Some(ticket) = self.queue.start(id) else {
            tracing::debug!(job_id = %id, "Export no longer pending, skipped");
            return;
        };

        let final_path = self.queue.export_path().join(&ticket.file_name);
        let partial_path = partial_path(&final_path);

        match self.execute(&ticket, &partial_path, &final_path).await {
            Ok(summary) => match self.queue.complete(id, ticket.file_name.clone()) {
                Ok(()) => tracing::info!(
                    job_id = %id,
                    file = %ticket.file_name,
                    rows = summary.rows,
                    bytes = summary.bytes,
                    "Export completed"
                ),
                Err(e) => {
                    remove_artifact(&final_path).await;
                    tracing::info!(job_id = %id, reason = %e, "Export discarded after completion");
                }
            },
            Err(ExportError::Canceled) => {
                remove_artifact(&partial_path).await;
                self.queue.mark_canceled(id);
                tracing::info!(job_id = %id, "Export canceled");
            }
            Err(e) => {
                remove_artifact(&partial_path).await;
                tracing::error!(job_id = %id, error = %e, code = e.code(), "Export failed");
                self.queue.fail(id, e.to_string());
            }
        }
    }

    async fn execute(
        &self,
        ticket: &RunTicket,
        partial_path: &Path,
        final_path: &Path,
    ) -> Result<PipelineSummary, ExportError> {
        let request = &ticket.request;
        let backend = self.backends.for_source(&request.source)?;

        let queue = self.queue.clone();
        let id = ticket.id;
        let export = StreamedExport::new(
            request.source.queries(),
            backend,
            request.csv.clone(),
            request.page_size(self.batch_size),
        )
        .with_cancellation(ticket.cancel.clone())
        .with_progress(Arc::new(move |progress: f32| queue.set_progress(id, progress)));

        let mut sink = FileSink::create(partial_path).await?;
        let summary = export.run(&mut sink).await?;
        sink.finish().await?;
        tokio::fs::rename(partial_path, final_path).await?;
        Ok(summary)
    }
}

fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exports::job::ExportStatus;
    use crate::exports::queue::{Admission, DeleteOutcome};
    use rulestream_core::{CsvParameters, Fact, FactParameters, Hit, UserRef};
    use async_trait::async_trait;
    use rulestream_db_memory::InMemorySearchBackend;
    use rulestream_storage::{DynSearchBackend, ExportQuery, HitPage, PageRequest, SearchBackend, StorageError};
    use serde_json::json;
    use std::time::Duration;

    fn rows(n: usize) -> Vec<Hit> {
        (0..n)
            .map(|i| json!({"n": i}).as_object().cloned().unwrap())
            .collect()
    }

    /// Serves one page, then panics on the next fetch.
    struct CrashingBackend;

    #[async_trait]
    impl SearchBackend for CrashingBackend {
        async fn fetch_page(
            &self,
            _query: &ExportQuery,
            page: PageRequest,
        ) -> Result<HitPage, StorageError> {
            if page.offset > 0 {
                panic!("search node crashed");
            }
            Ok(HitPage {
                hits: rows(2),
                has_more: true,
            })
        }
    }

    fn setup(
        backend: impl SearchBackend + 'static,
        dir: &Path,
    ) -> (Arc<ExportQueue>, ExportWorker, mpsc::UnboundedReceiver<Uuid>) {
        let (queue, jobs) = ExportQueue::new(5, dir);
        let queue = Arc::new(queue);
        let backend: DynSearchBackend = Arc::new(backend);
        let worker = ExportWorker::new(queue.clone(), Arc::new(SearchBackends::new(backend)), 2);
        (queue, worker, jobs)
    }

    fn admit(queue: &ExportQueue, ids: &[i64]) -> Uuid {
        let facts = ids
            .iter()
            .map(|id| Fact::new(*id, "f", json!({})))
            .collect();
        match queue
            .add_to_queue(facts, "Door events", CsvParameters::default(), UserRef::new("u1"), FactParameters::new(), true)
            .unwrap()
        {
            Admission::Added(job) => job.id,
            other => panic!("unexpected admission {other:?}"),
        }
    }

    async fn wait_for_status(queue: &ExportQueue, id: Uuid, status: ExportStatus) {
        for _ in 0..200 {
            if queue
                .user_export(id, &UserRef::new("u1"))
                .is_some_and(|j| j.status == status)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test]
    async fn completed_job_has_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemorySearchBackend::new();
        backend.set_fact_hits(1, rows(5));
        let (queue, worker, _jobs) = setup(backend, dir.path());

        let id = admit(&queue, &[1]);
        worker.run_job(id).await;

        let job = queue.user_export(id, &UserRef::new("u1")).unwrap();
        assert_eq!(job.status, ExportStatus::Completed);
        assert_eq!(job.progress, 1.0);
        let file_name = job.file_name.unwrap();
        assert_eq!(file_name, format!("door-events_{id}.csv"));

        let content = tokio::fs::read_to_string(dir.path().join(&file_name)).await.unwrap();
        assert_eq!(content, "n\n0\n1\n2\n3\n4\n");
        assert!(!dir.path().join(format!("{file_name}.partial")).exists());
    }

    #[tokio::test]
    async fn failed_job_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemorySearchBackend::new();
        backend.set_fact_hits(1, rows(5));
        backend.fail_on("fact:2", "index closed");
        let (queue, worker, _jobs) = setup(backend, dir.path());

        let id = admit(&queue, &[1, 2]);
        worker.run_job(id).await;

        let job = queue.user_export(id, &UserRef::new("u1")).unwrap();
        assert_eq!(job.status, ExportStatus::Failed);
        assert!(job.error.unwrap().contains("index closed"));
        assert!(job.file_name.is_none());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_while_running_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemorySearchBackend::new().with_page_delay(Duration::from_millis(20));
        backend.set_fact_hits(1, rows(50));
        let (queue, worker, jobs) = setup(backend, dir.path());
        let shutdown = CancellationToken::new();
        let dispatcher = worker.spawn(jobs, 1, shutdown.clone());

        let id = admit(&queue, &[1]);
        wait_for_status(&queue, id, ExportStatus::Running).await;
        assert_eq!(
            queue.delete_export(id, &UserRef::new("u1")).await,
            DeleteOutcome::Canceled
        );
        wait_for_status(&queue, id, ExportStatus::Canceled).await;

        let job = queue.user_export(id, &UserRef::new("u1")).unwrap();
        assert!(job.file_name.is_none());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        shutdown.cancel();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn job_deleted_before_start_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemorySearchBackend::new();
        backend.set_fact_hits(1, rows(1));
        let (queue, worker, _jobs) = setup(backend, dir.path());

        let id = admit(&queue, &[1]);
        queue.delete_export(id, &UserRef::new("u1")).await;
        worker.run_job(id).await;
        assert!(queue.user_export(id, &UserRef::new("u1")).is_none());
    }

    #[tokio::test]
    async fn panicking_job_fails_and_discards_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, worker, jobs) = setup(CrashingBackend, dir.path());
        let shutdown = CancellationToken::new();
        let dispatcher = worker.spawn(jobs, 1, shutdown.clone());

        let id = admit(&queue, &[1]);
        wait_for_status(&queue, id, ExportStatus::Failed).await;

        let job = queue.user_export(id, &UserRef::new("u1")).unwrap();
        assert!(job.error.unwrap().contains("export task failed"));
        assert!(job.file_name.is_none());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        shutdown.cancel();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_and_drains_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemorySearchBackend::new().with_page_delay(Duration::from_millis(20));
        backend.set_fact_hits(1, rows(100));
        let (queue, worker, jobs) = setup(backend, dir.path());
        let shutdown = CancellationToken::new();
        let dispatcher = worker.spawn(jobs, 1, shutdown.clone());

        let id = admit(&queue, &[1]);
        wait_for_status(&queue, id, ExportStatus::Running).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), dispatcher)
            .await
            .expect("dispatcher drains running jobs")
            .unwrap();

        let job = queue.user_export(id, &UserRef::new("u1")).unwrap();
        assert_eq!(job.status, ExportStatus::Canceled);
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
