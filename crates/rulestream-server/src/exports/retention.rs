use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::ExportQueue;

/// Deletes regular files in `dir` that no job references and that were not
/// modified within `max_age`.
pub async fn remove_orphaned_files(
    dir: &Path,
    keep: &HashSet<String>,
    max_age: Duration,
) -> std::io::Result<usize> {
    if let Err(err) = fs::metadata(dir).await {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Ok(0);
        }
        return Err(err);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if keep.contains(&name) {
            continue;
        }
        if let Ok(metadata) = entry.metadata().await
            && let Ok(modified) = metadata.modified()
            && let Ok(age) = now.duration_since(modified)
            && age > max_age
        {
            tracing::info!(
                path = %entry.path().display(),
                age_hours = age.as_secs() / 3600,
                "Removing orphaned export file"
            );
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Runs [`ExportQueue::cleanup_expired`] every `interval` until `shutdown` fires.
pub fn start_cleanup_task(
    queue: Arc<ExportQueue>,
    interval: Duration,
    retention: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = queue.cleanup_expired(retention).await;
            if report.jobs > 0 || report.files > 0 {
                tracing::info!(jobs = report.jobs, files = report.files, "Export retention cleanup completed");
            }
        }
        tracing::debug!("Export retention task stopped");
    })
}
