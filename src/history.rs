//! Build history
//!
//! Appends one JSON line per finished build to
//! `~/.local/state/strata/history.log`. Dry runs are not recorded.

use crate::build::report::BuildReport;
use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// File-based build history that appends JSON lines
pub struct BuildHistory {
    enabled: bool,
    path: PathBuf,
}

impl BuildHistory {
    /// Create a history log from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.history_log,
            path: ConfigManager::history_log_path(),
        }
    }

    /// Path of the history file
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Record a finished build
    pub async fn record(&self, report: &BuildReport) {
        if report.dry_run {
            return;
        }

        let event = if report.is_success() {
            "build.completed"
        } else {
            "build.failed"
        };
        let data = serde_json::json!({
            "build_id": report.build_id,
            "target": report.target,
            "duration_ms": report.duration_ms,
            "steps": report.summary.steps,
            "hits": report.summary.hits,
            "misses": report.summary.misses,
            "fingerprint": report.image.as_ref().map(|i| i.fingerprint.as_str()),
            "size_bytes": report.summary.size_bytes,
            "error": report.error.as_ref().map(|e| e.to_string()),
        });
        self.log(event, &data).await;
    }

    /// Log an event as a JSON line
    ///
    /// IO failures are logged and dropped; history never fails a build.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize history event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write build history: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
