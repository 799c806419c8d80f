use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{info, warn};

use crate::SyncReport;

/// Write `<dir>/<run_id>/sync_report.json` and `run_brief.md`; returns the
/// run directory.
pub async fn write_run_report(dir: &Path, report: &SyncReport) -> Result<PathBuf> {
    let run_dir = dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "report": report,
        "fatal": report.fatal.as_ref().map(|e| e.to_string()),
        "exit_code": report.exit_code(),
    }))
    .context("serializing sync report")?;
    fs::write(run_dir.join("sync_report.json"), json)
        .await
        .context("writing sync_report.json")?;

    fs::write(run_dir.join("run_brief.md"), render_brief(report))
        .await
        .context("writing run_brief.md")?;

    Ok(run_dir)
}

/// [`write_run_report`] that logs a failure instead of returning it.
pub async fn persist_run_report(dir: &Path, report: &SyncReport) -> Option<PathBuf> {
    match write_run_report(dir, report).await {
        Ok(run_dir) => {
            info!(path = %run_dir.display(), "run report written");
            Some(run_dir)
        }
        Err(err) => {
            warn!(error = ?err, dir = %dir.display(), "could not write run report");
            None
        }
    }
}

fn render_brief(report: &SyncReport) -> String {
    let window = report
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "n/a".to_string());
    let mut brief = format!(
        "# Sync run `{}`\n\n- Site: {}\n- Window: {}\n- State: {:?}\n- Pages fetched: {}\n- Rows fetched: {}\n- Created: {}\n- Updated: {}\n- Failed: {}\n- Destination requests: {}\n- Throttle retries: {}\n",
        report.run_id,
        report.site_url,
        window,
        report.state,
        report.pages_fetched,
        report.rows_fetched,
        report.created,
        report.updated,
        report.failed(),
        report.destination_requests,
        report.throttle_retries,
    );
    if let Some(err) = &report.fatal {
        brief.push_str(&format!("\n## Fatal error\n{err}\n"));
    }
    if !report.failures.is_empty() {
        brief.push_str("\n## Row failures\n");
        for failure in &report.failures {
            brief.push_str(&format!(
                "- `{}` ({}, {} attempt(s)): {}\n",
                failure.key, failure.operation, failure.attempts, failure.message
            ));
        }
    }
    if !report.ambiguities.is_empty() {
        brief.push_str("\n## Duplicate keys in destination\n");
        for ambiguity in &report.ambiguities {
            brief.push_str(&format!(
                "- `{}`: {} records, updated {}\n",
                ambiguity.key, ambiguity.matches, ambiguity.chosen
            ));
        }
    }
    brief
}
