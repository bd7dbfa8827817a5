//! Export subsystem: admission queue, job lifecycle, streaming pipeline,
//! background worker, retention and delivery.

pub mod backends;
pub mod delivery;
pub mod encoder;
pub mod error;
pub mod fingerprint;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod retention;
pub mod routes;
pub mod service;
pub mod sink;
pub mod worker;

pub use backends::SearchBackends;
pub use delivery::DeliveryMode;
pub use error::ExportError;
pub use job::{ExportJob, ExportRequest, ExportSource, ExportStatus};
pub use pipeline::{PipelineSummary, StreamedExport};
pub use queue::{Admission, CleanupReport, DeleteOutcome, ExportQueue, SearchTarget};
pub use service::ExportService;
pub use worker::ExportWorker;
