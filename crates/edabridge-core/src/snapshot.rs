//! Fire-and-forget status persistence.
//!
//! Snapshots are handed to a background task over a small bounded queue.
//! A full queue drops the snapshot and a failed write is only logged, so
//! nothing on the protocol path ever waits on the filesystem.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const QUEUE_DEPTH: usize = 8;

pub struct SnapshotWriter<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for SnapshotWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Serialize + Send + 'static> SnapshotWriter<T> {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(write_loop(path.into(), rx));
        Self { tx }
    }

    /// Queue a snapshot. Never blocks.
    pub fn offer(&self, snapshot: T) {
        if let Err(e) = self.tx.try_send(snapshot) {
            tracing::trace!("Snapshot dropped: {}", e);
        }
    }
}

async fn write_loop<T: Serialize>(path: PathBuf, mut rx: mpsc::Receiver<T>) {
    while let Some(mut snapshot) = rx.recv().await {
        // Only the newest queued snapshot matters.
        while let Ok(newer) = rx.try_recv() {
            snapshot = newer;
        }
        // Serialized before the write so `T` need not be `Sync`.
        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Failed to serialize snapshot: {}", e);
                continue;
            }
        };
        if let Err(e) = write_snapshot(&path, bytes).await {
            tracing::debug!("Failed to persist snapshot to {}: {}", path.display(), e);
        }
    }
}

async fn write_snapshot(path: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::time::Duration;

    async fn read_until(path: &Path, expected: &Value) -> bool {
        for _ in 0..100 {
            if let Ok(bytes) = tokio::fs::read(path).await
                && serde_json::from_slice::<Value>(&bytes).ok().as_ref() == Some(expected)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn persists_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let writer = SnapshotWriter::spawn(&path);

        writer.offer(json!({"n": 1}));
        writer.offer(json!({"n": 2}));

        assert!(read_until(&path, &json!({"n": 2})).await);
    }

    #[derive(Serialize)]
    struct Counter {
        hits: std::cell::Cell<u32>,
    }

    #[tokio::test]
    async fn accepts_send_but_not_sync_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        let writer = SnapshotWriter::spawn(&path);

        let counter = Counter {
            hits: std::cell::Cell::new(0),
        };
        counter.hits.set(3);
        writer.offer(counter);

        assert!(read_until(&path, &json!({"hits": 3})).await);
    }

    #[tokio::test]
    async fn unwritable_path_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("status.json");
        let writer = SnapshotWriter::spawn(&path);
        for n in 0..32 {
            writer.offer(json!({"n": n}));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!path.exists());
    }
}
