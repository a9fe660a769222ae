//! Filesystem backend: appends LDJSON to per-source files under a base
//! path, rotated either daily or by size.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use jt_protocol::Envelope;
use tokio::io::AsyncWriteExt;

use super::{BackendAdapter, SendResult};
use crate::error::BackendError;

pub struct FilesystemBackend {
    base_path: PathBuf,
    rotate_size_mb: Option<u64>,
}

impl FilesystemBackend {
    pub fn new(base_path: impl Into<PathBuf>, rotate_size_mb: Option<u64>) -> Self {
        FilesystemBackend {
            base_path: base_path.into(),
            rotate_size_mb,
        }
    }

    /// `<base>/<source>-YYYY-MM-DD.jsonl` under daily rotation, or
    /// `<base>/<source>.jsonl` when rotation is by size (the size check
    /// itself happens in [`Self::rotate_if_oversized`]).
    fn file_path(&self, src: &str) -> PathBuf {
        match self.rotate_size_mb {
            None => {
                let today = chrono::Utc::now().format("%Y-%m-%d");
                self.base_path.join(format!("{src}-{today}.jsonl"))
            }
            Some(_) => self.base_path.join(format!("{src}.jsonl")),
        }
    }

    async fn rotate_if_oversized(&self, path: &Path) -> std::io::Result<()> {
        let Some(limit_mb) = self.rotate_size_mb else {
            return Ok(());
        };
        let limit_bytes = limit_mb * 1024 * 1024;
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return Ok(());
        };
        if meta.len() < limit_bytes {
            return Ok(());
        }
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let rotated = path.with_extension(format!("{stamp}.jsonl"));
        tokio::fs::rename(path, rotated).await
    }

    async fn append(&self, src: &str, messages: &[&Envelope]) -> std::io::Result<usize> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let path = self.file_path(src);
        self.rotate_if_oversized(&path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut sent = 0;
        for envelope in messages {
            let bytes = jt_protocol::encode(envelope)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            file.write_all(&bytes).await?;
            sent += 1;
        }
        file.flush().await?;
        Ok(sent)
    }
}

#[async_trait]
impl BackendAdapter for FilesystemBackend {
    async fn init(&self) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))
    }

    async fn send_batch(&self, messages: &[Envelope]) -> SendResult {
        let start = Instant::now();
        let mut by_src: BTreeMap<&str, Vec<&Envelope>> = BTreeMap::new();
        for m in messages {
            by_src.entry(m.src.as_str()).or_default().push(m);
        }

        let mut count_sent = 0;
        let mut count_failed = 0;
        let mut last_error = None;
        for (src, msgs) in by_src {
            let expected = msgs.len();
            match self.append(src, &msgs).await {
                Ok(n) => count_sent += n,
                Err(e) => {
                    count_failed += expected;
                    last_error = Some(e.to_string());
                }
            }
        }

        let latency = start.elapsed();
        SendResult {
            ok: count_failed == 0,
            count_sent,
            count_failed,
            error: last_error,
            latency,
        }
    }

    async fn health(&self) -> bool {
        tokio::fs::create_dir_all(&self.base_path).await.is_ok()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use jt_protocol::{EventPayload, Level, Payload};

    fn event(src: &str) -> Envelope {
        Envelope::new(
            src,
            jt_protocol::now_millis(),
            Payload::Event(EventPayload {
                level: Level::Info,
                msg: "hi".to_owned(),
                ctx: None,
            }),
        )
    }

    #[tokio::test]
    async fn writes_one_line_per_message_grouped_by_source() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path(), None);
        let batch = vec![event("hello"), event("hello"), event("other")];
        let result = backend.send_batch(&batch).await;
        assert!(result.ok);
        assert_eq!(result.count_sent, 3);

        let today = chrono::Utc::now().format("%Y-%m-%d");
        let hello_path = dir.path().join(format!("hello-{today}.jsonl"));
        let contents = tokio::fs::read_to_string(&hello_path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn size_rotation_renames_the_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path(), Some(0)); // rotate immediately
        backend.send_batch(&[event("svc")]).await;
        backend.send_batch(&[event("svc")]).await;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert!(count >= 2, "expected a rotated file plus the active file");
    }
}
