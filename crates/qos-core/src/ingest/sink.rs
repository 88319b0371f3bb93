//! Correction sinks

use super::CorrectionSink;
use crate::models::CorrectionAction;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Logs every correction; nothing is executed
#[derive(Debug, Default, Clone)]
pub struct LogSink {
    node_name: String,
}

impl LogSink {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl CorrectionSink for LogSink {
    async fn execute(&self, actions: &[CorrectionAction]) -> Result<()> {
        for action in actions {
            warn!(
                event = "correction_dry_run",
                node = %self.node_name,
                target = %action.target,
                kind = ?action.kind,
                "Would terminate workload"
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CorrectionRecord<'a> {
    issued_at: i64,
    #[serde(flatten)]
    action: &'a CorrectionAction,
}

/// Appends corrections to a JSON lines file for an external executor
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CorrectionSink for JsonLinesSink {
    async fn execute(&self, actions: &[CorrectionAction]) -> Result<()> {
        let issued_at = chrono::Utc::now().timestamp();
        let mut buffer = String::new();
        for action in actions {
            buffer.push_str(&serde_json::to_string(&CorrectionRecord { issued_at, action })?);
            buffer.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open corrections file {}", self.path.display()))?;
        file.write_all(buffer.as_bytes())
            .await
            .with_context(|| format!("Failed to write corrections to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}
