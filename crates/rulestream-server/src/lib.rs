pub mod config;
pub mod exports;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::{AppConfig, ExportsConfig, ServerConfig};
pub use exports::{ExportError, ExportQueue, ExportService};
pub use identity::{Caller, CallerContext};
pub use observability::init_tracing;
pub use server::{AppState, RulestreamServer, ServerBuilder, build_app};
