//! JSON lines snapshot source

use super::UsageSource;
use crate::models::UsageSnapshot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Reads one `UsageSnapshot` per line. The read position is kept between
/// calls, so lines appended later are picked up by the next poll.
pub struct JsonLinesSource {
    path: PathBuf,
    reader: Mutex<Option<BufReader<File>>>,
    line_number: Mutex<u64>,
}

impl JsonLinesSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: Mutex::new(None),
            line_number: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UsageSource for JsonLinesSource {
    async fn next_snapshot(&self) -> Result<Option<UsageSnapshot>> {
        let mut guard = self.reader.lock().await;
        if guard.is_none() {
            let file = File::open(&self.path)
                .await
                .with_context(|| format!("Failed to open snapshot file {}", self.path.display()))?;
            *guard = Some(BufReader::new(file));
        }
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };

        let mut line_number = self.line_number.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .await
                .with_context(|| format!("Failed to read {}", self.path.display()))?;
            if read == 0 {
                debug!(path = %self.path.display(), "No new snapshot");
                return Ok(None);
            }
            *line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageSnapshot>(trimmed) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = *line_number,
                    error = %e,
                    "Malformed snapshot line skipped"
                ),
            }
        }
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_reads_snapshots_in_order_and_skips_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"timestamp": 1.0, "samples": []}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"timestamp": 2.0, "total_cpus": 8.0, "samples": []}}"#).unwrap();
        file.flush().unwrap();

        let source = JsonLinesSource::new(file.path());
        assert_eq!(source.next_snapshot().await.unwrap().map(|s| s.timestamp), Some(1.0));

        let second = source.next_snapshot().await.unwrap().unwrap();
        assert_eq!(second.timestamp, 2.0);
        assert_eq!(second.total_cpus, Some(8.0));

        assert!(source.next_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_picks_up_appended_lines() {
        let mut file = NamedTempFile::new().unwrap();
        let source = JsonLinesSource::new(file.path());
        assert!(source.next_snapshot().await.unwrap().is_none());

        writeln!(file, r#"{{"timestamp": 3.0, "samples": []}}"#).unwrap();
        file.flush().unwrap();
        assert_eq!(source.next_snapshot().await.unwrap().map(|s| s.timestamp), Some(3.0));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let source = JsonLinesSource::new("/nonexistent/snapshots.jsonl");
        assert!(source.next_snapshot().await.is_err());
        assert!(source.describe().starts_with("jsonl:"));
    }
}
