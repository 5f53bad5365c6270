//! Retention policy — prune old rotated chunk files.
//!
//! Rotated chunks (`{session_id}_chunk_{n}.jsonl.gz`) older than the
//! configured number of days are deleted. Active `{session_id}.jsonl.gz`
//! files are never touched.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

/// Delete rotated chunk files older than `retention_days`.
///
/// Returns the number of files deleted. Errors on individual files are
/// logged and skipped so one bad file doesn't abort the pass.
pub async fn prune_chunks(traces_dir: &Path, retention_days: u32) -> Result<u32> {
    if !traces_dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let mut deleted: u32 = 0;

    let mut entries = tokio::fs::read_dir(traces_dir)
        .await
        .with_context(|| format!("read traces dir: {}", traces_dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        // Only rotated chunks are eligible.
        if !name.contains("_chunk_") || !name.ends_with(".jsonl.gz") {
            continue;
        }

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "retention: could not stat file");
                continue;
            }
        };
        let modified = match metadata.modified() {
            Ok(t) => t,
            Err(_) => continue,
        };

        let modified_dt: chrono::DateTime<Utc> = modified.into();
        if modified_dt < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(_) => {
                    info!(path = %path.display(), "retention: pruned old chunk file");
                    deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), err = %e, "retention: failed to delete chunk");
                }
            }
        }
    }

    Ok(deleted)
}
