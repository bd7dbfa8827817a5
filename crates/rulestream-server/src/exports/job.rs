//! Export job record and its lifecycle.
//!
//! A job is created Pending by the queue, picked up by the worker (Running) and
//! ends Completed, Canceled or Failed:
//!
//! ```text
//! Pending ──► Running ──► Completed
//!    │           ├──────► Failed
//!    └───────────┴──────► Canceled
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use rulestream_core::{CoreError, CsvParameters, Fact, FactParameters, SearchSpec, UserRef};
use rulestream_storage::ExportQuery;
use serde::{Deserialize, Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl ExportStatus {
    pub fn can_transition_to(self, next: ExportStatus) -> bool {
        use ExportStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, Completed)
                | (Running, Canceled)
                | (Running, Failed)
        )
    }

    /// Pending and Running jobs count against the queue capacity.
    pub fn is_active(self) -> bool {
        matches!(self, ExportStatus::Pending | ExportStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Running => "running",
            ExportStatus::Completed => "completed",
            ExportStatus::Canceled => "canceled",
            ExportStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What an export reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportSource {
    Facts {
        facts: Vec<Fact>,
        parameters: FactParameters,
    },
    Custom {
        indices: String,
        search_requests: Vec<SearchSpec>,
        /// Name of the configured search backend
        backend: String,
    },
}

impl ExportSource {
    /// One query per fact or search request, in request order.
    pub fn queries(&self) -> Vec<ExportQuery> {
        match self {
            ExportSource::Facts { facts, parameters } => facts
                .iter()
                .map(|fact| ExportQuery::Fact {
                    fact: fact.clone(),
                    parameters: parameters.clone(),
                })
                .collect(),
            ExportSource::Custom {
                indices,
                search_requests,
                ..
            } => search_requests
                .iter()
                .enumerate()
                .map(|(position, request)| ExportQuery::Search {
                    indices: indices.clone(),
                    request: request.clone(),
                    position,
                })
                .collect(),
        }
    }
}

/// Everything needed to run one export; the job's immutable part.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub title: String,
    pub source: ExportSource,
    pub csv: CsvParameters,
    /// Page through the backend with the configured batch size
    pub streaming: bool,
}

impl ExportRequest {
    /// Checks the preconditions shared by every admission path.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.title.trim().is_empty() {
            return Err(CoreError::EmptyTitle.into());
        }
        self.csv.validate()?;
        match &self.source {
            ExportSource::Facts { facts, .. } if facts.is_empty() => {
                Err(CoreError::EmptyFactList.into())
            }
            ExportSource::Custom { indices, .. } if indices.trim().is_empty() => {
                Err(CoreError::EmptyIndices.into())
            }
            ExportSource::Custom {
                search_requests, ..
            } if search_requests.is_empty() => Err(CoreError::EmptySearchRequests.into()),
            _ => Ok(()),
        }
    }

    /// Rows requested per backend page. Non-streaming exports read each query
    /// in a single page bounded by the CSV limit.
    pub fn page_size(&self, batch_size: u64) -> u64 {
        match (self.streaming, self.csv.row_limit()) {
            (true, Some(limit)) => batch_size.min(limit),
            (true, None) => batch_size,
            (false, Some(limit)) => limit,
            (false, None) => u64::MAX,
        }
    }
}

/// Export job shared by all of its subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: Uuid,
    pub title: String,
    pub file_name: Option<String>,
    pub status: ExportStatus,
    /// Serialized as a count so callers never see other tenants
    #[serde(rename = "subscriberCount", serialize_with = "serialize_count")]
    pub users: Vec<UserRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub(crate) request: ExportRequest,
    #[serde(skip)]
    pub(crate) fingerprint: String,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
    #[serde(skip)]
    pub(crate) cancel_requested: bool,
}

impl ExportJob {
    pub fn new(request: ExportRequest, fingerprint: String, user: UserRef) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: request.title.clone(),
            file_name: None,
            status: ExportStatus::Pending,
            users: vec![user],
            created_at: now,
            updated_at: now,
            progress: 0.0,
            error: None,
            request,
            fingerprint,
            cancel: CancellationToken::new(),
            cancel_requested: false,
        }
    }

    pub fn has_user(&self, user: &UserRef) -> bool {
        self.users.contains(user)
    }

    /// Returns false when the user was already subscribed.
    pub fn add_user(&mut self, user: UserRef) -> bool {
        if self.has_user(&user) {
            return false;
        }
        self.users.push(user);
        self.updated_at = Utc::now();
        true
    }

    pub fn remove_user(&mut self, user: &UserRef) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u != user);
        let removed = self.users.len() != before;
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn transition(&mut self, to: ExportStatus) -> Result<(), ExportError> {
        if !self.status.can_transition_to(to) {
            return Err(ExportError::InvalidStatusTransition {
                from: self.status,
                to,
            });
        }
        tracing::debug!(job_id = %self.id, from = %self.status, to = %to, "Export status transition");
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Artifact name: `<slugified title>_<job id>.csv`.
    pub fn artifact_name(&self) -> String {
        format!("{}_{}.csv", slugify(&self.title), self.id)
    }
}

fn serialize_count<S: Serializer>(users: &[UserRef], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(users.len() as u64)
}

/// Lowercases and keeps `[a-z0-9]`, collapsing every other run into `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("export");
    }
    slug
}
