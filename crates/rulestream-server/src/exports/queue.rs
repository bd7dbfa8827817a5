//! Admission control for queued exports.
//!
//! The queue owns every [`ExportJob`]. Handlers and the worker only see
//! clones; all mutations go through the methods below under one lock, which
//! is never held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rulestream_core::{CsvParameters, Fact, FactParameters, SearchSpec, UserRef};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::ExportError;
use super::fingerprint::fingerprint;
use super::job::{ExportJob, ExportRequest, ExportSource, ExportStatus};

/// Outcome of an admission attempt.
#[derive(Debug, Clone)]
pub enum Admission {
    /// A new job was created and scheduled.
    Added(ExportJob),
    /// The request joined an existing job.
    UserAdded(ExportJob),
    /// The caller is already subscribed to the matching job.
    UserExists(ExportJob),
    /// Capacity exhausted, nothing was created.
    QueueFull,
}

impl Admission {
    pub fn job(&self) -> Option<&ExportJob> {
        match self {
            Admission::Added(job) | Admission::UserAdded(job) | Admission::UserExists(job) => {
                Some(job)
            }
            Admission::QueueFull => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Job and artifact removed.
    Deleted,
    /// Only the caller's subscription was removed.
    UserDeleted,
    /// The job is running; cancellation was requested.
    Canceled,
    NotFound,
}

/// Target of a custom export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTarget {
    pub indices: String,
    /// Name of the configured search backend
    pub backend: String,
}

/// What the worker needs to execute a job it just started.
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub id: Uuid,
    pub request: ExportRequest,
    pub file_name: String,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub jobs: usize,
    pub files: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, ExportJob>,
    /// Fingerprint -> job id for jobs that can still be joined
    fingerprints: HashMap<String, Uuid>,
}

impl QueueState {
    fn forget_fingerprint(&mut self, fingerprint: &str, id: Uuid) {
        if self.fingerprints.get(fingerprint) == Some(&id) {
            self.fingerprints.remove(fingerprint);
        }
    }

    fn active_count(&self) -> usize {
        self.jobs.values().filter(|j| j.status.is_active()).count()
    }
}

#[derive(Debug)]
pub struct ExportQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    export_path: PathBuf,
    dispatch: mpsc::UnboundedSender<Uuid>,
}

impl ExportQueue {
    /// Creates the queue and the receiving end of its dispatch channel, which
    /// yields the id of every admitted job in admission order.
    pub fn new(
        capacity: usize,
        export_path: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (dispatch, jobs) = mpsc::unbounded_channel();
        let queue = Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            export_path: export_path.into(),
            dispatch,
        };
        (queue, jobs)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn export_path(&self) -> &Path {
        &self.export_path
    }

    /// Admits a fact-based export.
    pub fn add_to_queue(
        &self,
        facts: Vec<Fact>,
        title: impl Into<String>,
        csv: CsvParameters,
        user: UserRef,
        parameters: FactParameters,
        streaming: bool,
    ) -> Result<Admission, ExportError> {
        let request = ExportRequest {
            title: title.into(),
            source: ExportSource::Facts { facts, parameters },
            csv,
            streaming,
        };
        self.admit(request, user)
    }

    /// Admits a custom search export. Backend activation and the search
    /// request limit are checked by the caller.
    pub fn add_to_queue_custom(
        &self,
        title: impl Into<String>,
        target: SearchTarget,
        search_requests: Vec<SearchSpec>,
        csv: CsvParameters,
        user: UserRef,
        streaming: bool,
    ) -> Result<Admission, ExportError> {
        let request = ExportRequest {
            title: title.into(),
            source: ExportSource::Custom {
                indices: target.indices,
                search_requests,
                backend: target.backend,
            },
            csv,
            streaming,
        };
        self.admit(request, user)
    }

    fn admit(&self, request: ExportRequest, user: UserRef) -> Result<Admission, ExportError> {
        request.validate()?;
        let fp = fingerprint(&request);

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(id) = state.fingerprints.get(&fp).copied() {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.has_user(&user) {
                    tracing::debug!(job_id = %id, user = %user, "Export already requested by user");
                    return Ok(Admission::UserExists(job.clone()));
                }
                tracing::info!(job_id = %id, user = %user, title = %job.title, "User joined existing export");
                job.add_user(user);
                return Ok(Admission::UserAdded(job.clone()));
            }
            state.fingerprints.remove(&fp);
        }

        if state.active_count() >= self.capacity {
            tracing::warn!(user = %user, title = %request.title, capacity = self.capacity, "Export queue full");
            return Ok(Admission::QueueFull);
        }

        let job = ExportJob::new(request, fp.clone(), user);
        let id = job.id;
        state.fingerprints.insert(fp, id);
        state.jobs.insert(id, job.clone());
        drop(guard);

        tracing::info!(job_id = %id, title = %job.title, user = %job.users[0], "Export queued");
        if self.dispatch.send(id).is_err() {
            tracing::error!(job_id = %id, "Export worker is not running, job stays pending");
        }
        Ok(Admission::Added(job))
    }

    /// Jobs the user is subscribed to, newest first.
    pub fn user_exports(&self, user: &UserRef) -> Vec<ExportJob> {
        let state = self.state.lock();
        let mut jobs: Vec<ExportJob> = state
            .jobs
            .values()
            .filter(|j| j.has_user(user))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// `None` both for unknown ids and for jobs the user is not subscribed to.
    pub fn user_export(&self, id: Uuid, user: &UserRef) -> Option<ExportJob> {
        let state = self.state.lock();
        state.jobs.get(&id).filter(|j| j.has_user(user)).cloned()
    }

    pub async fn delete_export(&self, id: Uuid, user: &UserRef) -> DeleteOutcome {
        let artifact = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(job) = state.jobs.get_mut(&id) else {
                return DeleteOutcome::NotFound;
            };
            if !job.has_user(user) {
                return DeleteOutcome::NotFound;
            }
            if job.users.len() > 1 {
                job.remove_user(user);
                tracing::info!(job_id = %id, user = %user, "User unsubscribed from export");
                return DeleteOutcome::UserDeleted;
            }
            if job.status == ExportStatus::Running {
                job.cancel_requested = true;
                job.cancel.cancel();
                let fp = job.fingerprint.clone();
                state.forget_fingerprint(&fp, id);
                tracing::info!(job_id = %id, user = %user, "Cancellation requested for running export");
                return DeleteOutcome::Canceled;
            }
            let Some(job) = state.jobs.remove(&id) else {
                return DeleteOutcome::NotFound;
            };
            job.cancel.cancel();
            state.forget_fingerprint(&job.fingerprint, id);
            job.file_name.map(|name| self.export_path.join(name))
        };

        if let Some(path) = artifact {
            remove_artifact(&path).await;
        }
        tracing::info!(job_id = %id, user = %user, "Export deleted");
        DeleteOutcome::Deleted
    }

    /// Number of pending and running jobs.
    pub fn active_count(&self) -> usize {
        self.state.lock().active_count()
    }

    /// Moves a pending job to Running. `None` when the job was deleted or
    /// canceled before the worker got to it.
    pub(crate) fn start(&self, id: Uuid) -> Option<RunTicket> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id)?;
        if job.status != ExportStatus::Pending || job.cancel.is_cancelled() {
            return None;
        }
        if let Err(e) = job.transition(ExportStatus::Running) {
            tracing::warn!(job_id = %id, error = %e, "Export cannot start");
            return None;
        }
        tracing::info!(job_id = %id, title = %job.title, "Export started");
        Some(RunTicket {
            id,
            request: job.request.clone(),
            file_name: job.artifact_name(),
            cancel: job.cancel.clone(),
        })
    }

    /// Final location of the job's artifact.
    pub(crate) fn artifact_path(&self, id: Uuid) -> Option<PathBuf> {
        let state = self.state.lock();
        state
            .jobs
            .get(&id)
            .map(|job| self.export_path.join(job.artifact_name()))
    }

    /// Fires the cancellation token of every running job. Returns how many
    /// were signaled.
    pub(crate) fn cancel_running(&self) -> usize {
        let state = self.state.lock();
        let mut canceled = 0;
        for job in state.jobs.values().filter(|j| j.status == ExportStatus::Running) {
            job.cancel.cancel();
            canceled += 1;
        }
        canceled
    }

    pub(crate) fn set_progress(&self, id: Uuid, progress: f32) {
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            job.progress = progress.clamp(0.0, 1.0);
            job.updated_at = Utc::now();
        }
    }

    /// Marks a running job Completed. Fails with [`ExportError::Canceled`]
    /// when cancellation was requested meanwhile; the job is then Canceled and
    /// the caller must discard the artifact.
    pub(crate) fn complete(&self, id: Uuid, file_name: String) -> Result<(), ExportError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let job = state.jobs.get_mut(&id).ok_or(ExportError::NotFound)?;
        if job.cancel_requested {
            job.transition(ExportStatus::Canceled)?;
            let fp = job.fingerprint.clone();
            state.forget_fingerprint(&fp, id);
            return Err(ExportError::Canceled);
        }
        job.transition(ExportStatus::Completed)?;
        job.file_name = Some(file_name);
        job.progress = 1.0;
        Ok(())
    }

    pub(crate) fn fail(&self, id: Uuid, message: String) {
        self.finish_unsuccessfully(id, ExportStatus::Failed, Some(message));
    }

    pub(crate) fn mark_canceled(&self, id: Uuid) {
        self.finish_unsuccessfully(id, ExportStatus::Canceled, None);
    }

    fn finish_unsuccessfully(&self, id: Uuid, status: ExportStatus, error: Option<String>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        if let Err(e) = job.transition(status) {
            tracing::warn!(job_id = %id, error = %e, "Ignoring export status update");
            return;
        }
        job.error = error;
        let fp = job.fingerprint.clone();
        state.forget_fingerprint(&fp, id);
    }

    /// Removes finished jobs not updated within `retention` together with
    /// their artifacts, then orphaned files older than `retention`.
    pub async fn cleanup_expired(&self, retention: Duration) -> CleanupReport {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return CleanupReport::default();
        };

        let (expired, keep) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let ids: Vec<Uuid> = state
                .jobs
                .values()
                .filter(|j| j.status.is_terminal() && j.updated_at < cutoff)
                .map(|j| j.id)
                .collect();
            let mut expired = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(job) = state.jobs.remove(&id) {
                    state.forget_fingerprint(&job.fingerprint, id);
                    expired.push(job);
                }
            }
            let keep: HashSet<String> = state
                .jobs
                .values()
                .flat_map(|j| {
                    let name = j.artifact_name();
                    [format!("{name}.partial"), name]
                })
                .collect();
            (expired, keep)
        };

        let mut report = CleanupReport {
            jobs: expired.len(),
            files: 0,
        };
        for job in &expired {
            tracing::info!(job_id = %job.id, status = %job.status, "Expired export removed");
            if let Some(name) = &job.file_name
                && remove_artifact(&self.export_path.join(name)).await
            {
                report.files += 1;
            }
        }
        match super::retention::remove_orphaned_files(&self.export_path, &keep, retention).await {
            Ok(n) => report.files += n,
            Err(e) => tracing::warn!(error = %e, path = %self.export_path.display(), "Orphan sweep failed"),
        }
        report
    }
}

/// Removes an artifact, treating a missing file as already removed.
pub(crate) async fn remove_artifact(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove export artifact");
            false
        }
    }
}
