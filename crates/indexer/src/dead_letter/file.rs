//! JSON-lines dead-letter store.
//!
//! One record per line. Appends are fsynced before `record` returns; removal
//! rewrites the file through a temporary sibling and an atomic rename, so a
//! crash leaves either the old or the new file, never a torn one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{DeadLetterError, DeadLetterRecord, DeadLetterStore};

#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    // Serializes appends against rewrites.
    write_lock: Mutex<()>,
}

impl FileDeadLetterStore {
    /// Use `path` as the dead-letter file, creating parent directories if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DeadLetterError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeadLetterRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    error = %err,
                    "skipping unreadable dead-letter line"
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let mut records = self.read_all().await?;
        records.truncate(limit);
        Ok(records)
    }

    async fn remove(&self, record_id: Uuid) -> Result<bool, DeadLetterError> {
        let _guard = self.write_lock.lock().await;
        let records = self.read_all().await?;
        let before = records.len();
        let kept: Vec<_> = records.into_iter().filter(|r| r.record_id != record_id).collect();
        if kept.len() == before {
            return Ok(false);
        }

        let mut buf = Vec::new();
        for record in &kept {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        Ok(true)
    }
}
