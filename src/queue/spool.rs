use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::queue::{MessageHandle, MessageQueue, ReceivedMessage};

const READY_DIR: &str = "ready";
const CLAIMED_DIR: &str = "claimed";
const TMP_DIR: &str = "tmp";
const SCAN_INTERVAL: Duration = Duration::from_millis(250);

/// A queue stored as one JSON file per message in a directory.
///
/// Any number of processes sharing the directory can post and receive.
/// Receivers claim a message by renaming it out of `ready/`; the rename is
/// atomic, so exactly one receiver wins each message.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    name: String,
    root: PathBuf,
}

impl SpoolQueue {
    /// Open (creating if needed) the queue rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [READY_DIR, CLAIMED_DIR, TMP_DIR] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| {
                    FleetError::Config(format!(
                        "cannot create spool queue at {}: {}",
                        root.display(),
                        e
                    ))
                })?;
        }
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        Ok(Self { name, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ready_path(&self, handle: &MessageHandle) -> PathBuf {
        self.root
            .join(READY_DIR)
            .join(format!("{}.json", handle.as_str()))
    }

    async fn write_ready(&self, handle: &MessageHandle, body: &str) -> Result<()> {
        let tmp = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.{}", handle.as_str(), Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, body).await.map_err(queue_err)?;
        tokio::fs::rename(&tmp, self.ready_path(handle))
            .await
            .map_err(queue_err)
    }

    /// Claim the oldest visible message, if any.
    async fn try_claim(&self) -> Result<Option<ReceivedMessage>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(READY_DIR))
            .await
            .map_err(queue_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(queue_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        for name in names {
            let from = self.root.join(READY_DIR).join(&name);
            let to = self.root.join(CLAIMED_DIR).join(&name);
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {}
                // Another receiver claimed it first.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(queue_err(e)),
            }
            let body = tokio::fs::read_to_string(&to).await.map_err(queue_err)?;
            tokio::fs::remove_file(&to).await.map_err(queue_err)?;
            let handle = MessageHandle::new(name.trim_end_matches(".json"));
            return Ok(Some(ReceivedMessage { handle, body }));
        }
        Ok(None)
    }
}

fn queue_err(e: std::io::Error) -> FleetError {
    FleetError::Queue(e.to_string())
}

#[async_trait]
impl MessageQueue for SpoolQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, body: String) -> Result<MessageHandle> {
        // Timestamp prefix keeps directory order close to post order.
        let handle = MessageHandle::new(format!(
            "{:013}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        ));
        self.write_ready(&handle, &body).await?;
        Ok(handle)
    }

    async fn receive(&self, hold_time: Duration) -> Result<Option<ReceivedMessage>> {
        let deadline = tokio::time::Instant::now() + hold_time;
        loop {
            if let Some(message) = self.try_claim().await? {
                return Ok(Some(message));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(SCAN_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn update(&self, handle: &MessageHandle, body: String) -> Result<()> {
        self.write_ready(handle, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn post_then_receive() {
        let dir = TempDir::new().unwrap();
        let queue = SpoolQueue::open(dir.path().join("jobs")).await.unwrap();
        assert_eq!(queue.name(), "jobs");

        let handle = queue.post("hello".into()).await.unwrap();
        let got = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(got.handle, handle);
        assert_eq!(got.body, "hello");
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_receivers_never_share_a_message() {
        let dir = TempDir::new().unwrap();
        let a = SpoolQueue::open(dir.path()).await.unwrap();
        let b = SpoolQueue::open(dir.path()).await.unwrap();
        for i in 0..20 {
            a.post(format!("m{}", i)).await.unwrap();
        }

        let mut seen = Vec::new();
        loop {
            let (x, y) = tokio::join!(a.receive(Duration::ZERO), b.receive(Duration::ZERO));
            let (x, y) = (x.unwrap(), y.unwrap());
            if x.is_none() && y.is_none() {
                break;
            }
            seen.extend(x.into_iter().chain(y).map(|m| m.body));
        }
        assert_eq!(seen.len(), 20);
        let distinct: HashSet<&String> = seen.iter().collect();
        assert_eq!(distinct.len(), 20);
    }

    #[tokio::test]
    async fn update_is_an_upsert() {
        let dir = TempDir::new().unwrap();
        let queue = SpoolQueue::open(dir.path()).await.unwrap();
        let handle = queue.post("v1".into()).await.unwrap();
        queue.update(&handle, "v2".into()).await.unwrap();

        let got = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(got.body, "v2");

        queue.update(&handle, "v3".into()).await.unwrap();
        let got = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!((got.handle, got.body.as_str()), (handle, "v3"));
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());
    }
}
