use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use steward_types::DecisionRecord;

use crate::error::StateError;

/// Append-only JSONL decision logs, one file per run id under
/// `<store_root>/decisions/`. The log is the durable audit trail: every
/// considered proposal lands here, including abstains.
pub struct DecisionLog {
    dir: PathBuf,
}

impl DecisionLog {
    pub async fn new(store_root: impl AsRef<Path>) -> Result<Self, StateError> {
        let dir = store_root.as_ref().join("decisions");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub async fn append(&self, record: &DecisionRecord) -> Result<(), StateError> {
        let path = self.path_for(&record.run_id);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn read(&self, run_id: &str) -> Result<Vec<DecisionRecord>, StateError> {
        let path = self.path_for(run_id);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).await?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DecisionRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(run_id, error = %err, "skipping malformed decision log line"),
            }
        }
        Ok(records)
    }

    /// Drops the oldest run logs beyond `keep_runs`, by modification time.
    pub async fn prune(&self, keep_runs: usize) -> Result<usize, StateError> {
        let mut logs = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            logs.push((modified, path));
        }
        logs.sort_by(|a, b| b.0.cmp(&a.0));
        let mut removed = 0;
        for (_, stale) in logs.into_iter().skip(keep_runs) {
            if fs::remove_file(&stale).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        // Run ids are UUIDs; keep the file name safe regardless.
        let safe = run_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.dir.join(format!("{safe}.jsonl"))
    }
}
