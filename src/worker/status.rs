use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::Clock;
use crate::protocol::{Job, JobId, StatusMessage};
use crate::queue::{MessageHandle, MessageQueue};
use crate::store::{BucketPath, ObjectStore};
use crate::worker::executor::ChildProcess;

/// A job whose process may still be running.
struct ActiveJob {
    status: StatusMessage,
    child: Box<dyn ChildProcess>,
    /// Kept open for the lifetime of the process; dropped on finish.
    log_file: Option<File>,
    handle: Option<MessageHandle>,
}

/// A finished job whose final report or log upload has not gone through yet.
struct Settling {
    status: StatusMessage,
    handle: Option<MessageHandle>,
    reported: bool,
    log_key: Option<String>,
}

impl Settling {
    fn is_settled(&self) -> bool {
        self.reported && self.log_key.is_none()
    }
}

/// Drives each active job's status message from `running` to `finished`
/// and ships its log once finished.
pub struct StatusTracker {
    instance_id: String,
    bucket: BucketPath,
    status_queue: Arc<dyn MessageQueue>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    active: BTreeMap<JobId, ActiveJob>,
    settling: Vec<Settling>,
}

impl StatusTracker {
    pub fn new(
        instance_id: impl Into<String>,
        bucket: BucketPath,
        status_queue: Arc<dyn MessageQueue>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            bucket,
            status_queue,
            store,
            clock,
            active: BTreeMap::new(),
            settling: Vec::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.active.contains_key(job_id)
    }

    /// Finished jobs still waiting on their final report or log upload.
    pub fn unsettled_count(&self) -> usize {
        self.settling.len()
    }

    /// Start tracking a freshly launched job and post its `running` status.
    pub async fn track(
        &mut self,
        job: Job,
        child: Box<dyn ChildProcess>,
        log_file: Option<File>,
        log_path: PathBuf,
    ) {
        let id = job.id().clone();
        let status = StatusMessage::running(
            job,
            self.instance_id.clone(),
            log_path,
            child.pid(),
            self.clock.utc_now(),
        );
        self.active.insert(
            id.clone(),
            ActiveJob {
                status,
                child,
                log_file,
                handle: None,
            },
        );
        self.update_job_status(&id, true).await;
    }

    /// Report the current state of one job.
    ///
    /// A new job gets its `running` message posted. Otherwise the process is
    /// polled: still running refreshes the message in place, exited finishes
    /// the job. Unknown or already finished jobs are ignored.
    pub async fn update_job_status(&mut self, job_id: &JobId, is_new: bool) {
        let Some(entry) = self.active.get_mut(job_id) else {
            return;
        };

        if is_new {
            push(self.status_queue.as_ref(), &entry.status, &mut entry.handle).await;
            return;
        }

        match entry.child.try_wait() {
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "Job is still running");
                entry.status.touch(self.clock.utc_now());
                push(self.status_queue.as_ref(), &entry.status, &mut entry.handle).await;
            }
            Ok(Some(code)) => self.finish(job_id, code).await,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to poll job process");
            }
        }
    }

    /// Advance every active job, then retry outstanding final reports.
    pub async fn update_all(&mut self) {
        if !self.active.is_empty() {
            tracing::debug!(running = self.active.len(), "Updating job statuses");
        }
        let ids: Vec<JobId> = self.active.keys().cloned().collect();
        for id in ids {
            self.update_job_status(&id, false).await;
        }
        self.retry_settling().await;
    }

    /// Wait for every active job to exit and report it.
    pub async fn finish_all(&mut self) {
        let ids: Vec<JobId> = self.active.keys().cloned().collect();
        for id in ids {
            let Some(entry) = self.active.get_mut(&id) else {
                continue;
            };
            tracing::info!(job_id = %id, "Waiting for job to complete");
            match entry.child.wait().await {
                Ok(code) => self.finish(&id, code).await,
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Lost track of job process");
                }
            }
        }
        self.retry_settling().await;
        if !self.settling.is_empty() {
            tracing::warn!(
                unsettled = self.settling.len(),
                "Some finished jobs could not be reported or uploaded"
            );
        }
    }

    async fn finish(&mut self, job_id: &JobId, code: i32) {
        let Some(mut entry) = self.active.remove(job_id) else {
            return;
        };
        if !entry.status.finish(code, self.clock.utc_now()) {
            return;
        }
        tracing::info!(job_id = %job_id, ret_code = code, "Job is complete");

        // Close the log before shipping it.
        entry.log_file.take();

        let log_path = &entry.status.local_log_file;
        let log_key = if log_path.is_file() {
            self.bucket
                .log_key(log_path)
                .map_err(|e| {
                    tracing::error!(job_id = %job_id, error = %e, "Cannot derive log key");
                })
                .ok()
        } else {
            tracing::warn!(job_id = %job_id, log_file = %log_path.display(), "No log file to upload");
            None
        };

        let mut settling = Settling {
            status: entry.status,
            handle: entry.handle,
            reported: false,
            log_key,
        };
        self.settle(&mut settling).await;
        if !settling.is_settled() {
            self.settling.push(settling);
        }
    }

    async fn settle(&self, settling: &mut Settling) {
        if !settling.reported {
            settling.reported = push(
                self.status_queue.as_ref(),
                &settling.status,
                &mut settling.handle,
            )
            .await;
        }
        if let Some(key) = &settling.log_key {
            let path = &settling.status.local_log_file;
            match self.store.put(key, path).await {
                Ok(()) => {
                    tracing::debug!(
                        job_id = %settling.status.job.id(),
                        from = %path.display(),
                        to = %format!("{}/{}", self.bucket.bucket, key),
                        "Copied log file"
                    );
                    settling.log_key = None;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        job_id = %settling.status.job.id(),
                        error = %e,
                        "Log upload failed, will retry"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %settling.status.job.id(),
                        error = %e,
                        "Log upload failed, giving up"
                    );
                    settling.log_key = None;
                }
            }
        }
    }

    async fn retry_settling(&mut self) {
        if self.settling.is_empty() {
            return;
        }
        let mut pending = std::mem::take(&mut self.settling);
        for settling in pending.iter_mut() {
            self.settle(settling).await;
        }
        pending.retain(|s| !s.is_settled());
        self.settling = pending;
    }
}

/// Post or update a status message.
///
/// Returns false only when the failure is transient and worth another try.
async fn push(
    queue: &dyn MessageQueue,
    status: &StatusMessage,
    handle: &mut Option<MessageHandle>,
) -> bool {
    let body = match status.encode() {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(job_id = %status.job.id(), error = %e, "Cannot encode status");
            return true;
        }
    };
    let result = if let Some(existing) = handle.as_ref() {
        queue.update(existing, body).await
    } else {
        queue.post(body).await.map(|posted| {
            *handle = Some(posted);
        })
    };
    match result {
        Ok(()) => true,
        Err(e) if e.is_transient() => {
            tracing::warn!(
                job_id = %status.job.id(),
                status = %status.state,
                error = %e,
                "Status update failed, will retry"
            );
            false
        }
        Err(e) => {
            tracing::error!(
                job_id = %status.job.id(),
                status = %status.state,
                error = %e,
                "Status update failed, giving up"
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::error::{FleetError, Result};
    use crate::protocol::{decode_status, BatchId, JobSpec};
    use crate::queue::{InMemoryQueue, ReceivedMessage};
    use crate::store::MemoryObjectStore;
    use crate::worker::executor::FailedLaunch;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Refuses the first `failures` posts, with a permanent error if `fatal`.
    struct RefusingQueue {
        failures: AtomicUsize,
        fatal: bool,
        inner: InMemoryQueue,
    }

    #[async_trait]
    impl MessageQueue for RefusingQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn post(&self, body: String) -> Result<MessageHandle> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                if self.fatal {
                    return Err(FleetError::Internal("rejected".into()));
                }
                return Err(FleetError::Queue("throttled".into()));
            }
            self.inner.post(body).await
        }

        async fn receive(&self, hold_time: Duration) -> Result<Option<ReceivedMessage>> {
            self.inner.receive(hold_time).await
        }

        async fn update(&self, handle: &MessageHandle, body: String) -> Result<()> {
            self.inner.update(handle, body).await
        }
    }

    struct Fixture {
        tracker: StatusTracker,
        queue: Arc<RefusingQueue>,
        store: Arc<MemoryObjectStore>,
        dir: TempDir,
    }

    /// Store whose uploads always fail with `error`.
    struct BrokenStore {
        error: fn() -> FleetError,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for BrokenStore {
        async fn put(&self, _key: &str, _local_path: &Path) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    fn fixture(post_failures: usize) -> Fixture {
        build_fixture(post_failures, false)
    }

    fn build_fixture(post_failures: usize, fatal: bool) -> Fixture {
        let queue = Arc::new(RefusingQueue {
            failures: AtomicUsize::new(post_failures),
            fatal,
            inner: InMemoryQueue::new("status"),
        });
        let store = Arc::new(MemoryObjectStore::new());
        let tracker = StatusTracker::new(
            "i-1",
            BucketPath::parse("bucket/prefix").unwrap(),
            queue.clone(),
            store.clone(),
            Arc::new(TokioClock),
        );
        Fixture {
            tracker,
            queue,
            store,
            dir: TempDir::new().unwrap(),
        }
    }

    async fn track(f: &mut Fixture, id: &str, code: i32) -> JobId {
        let job = JobSpec::new(["true"])
            .unwrap()
            .into_job(JobId::new(id), BatchId::new("B"));
        let log_path = f.dir.path().join(job.log_file_name());
        let log = File::create(&log_path).unwrap();
        f.tracker
            .track(job, Box::new(FailedLaunch::new(code)), Some(log), log_path)
            .await;
        JobId::new(id)
    }

    #[tokio::test]
    async fn finish_happens_once() {
        let mut f = fixture(0);
        let id = track(&mut f, "1", 4).await;
        assert!(f.tracker.is_active(&id));

        f.tracker.update_job_status(&id, false).await;
        assert!(!f.tracker.is_active(&id));

        // Finished jobs are no longer tracked; polling again is a no-op.
        f.tracker.update_job_status(&id, false).await;
        f.tracker.update_all().await;

        assert_eq!(f.store.uploads().await, vec!["prefix/logs/job_1.log"]);
        let messages = f.queue.inner.drain().await;
        assert_eq!(messages.len(), 1);
        let status = decode_status(&messages[0].body).unwrap();
        assert_eq!(status.ret_code(), Some(4));
        assert_eq!(status.instance, "i-1");
    }

    #[tokio::test]
    async fn failed_first_post_is_retried() {
        let mut f = fixture(1);
        let id = track(&mut f, "1", 0).await;
        assert!(f.queue.inner.is_empty().await);

        // The next update posts the finished status under a fresh handle.
        f.tracker.update_job_status(&id, false).await;
        let messages = f.queue.inner.drain().await;
        assert_eq!(messages.len(), 1);
        assert!(decode_status(&messages[0].body).unwrap().is_finished());
        assert_eq!(f.tracker.unsettled_count(), 0);
    }

    #[tokio::test]
    async fn missing_log_is_not_uploaded() {
        let mut f = fixture(0);
        let id = track(&mut f, "1", 0).await;
        std::fs::remove_file(f.dir.path().join("job_1.log")).unwrap();

        f.tracker.update_job_status(&id, false).await;
        assert!(f.store.uploads().await.is_empty());
        assert_eq!(f.tracker.unsettled_count(), 0);
    }

    #[tokio::test]
    async fn permanent_report_failure_is_dropped() {
        let mut f = build_fixture(usize::MAX, true);
        let id = track(&mut f, "1", 0).await;

        f.tracker.update_job_status(&id, false).await;
        assert_eq!(f.tracker.unsettled_count(), 0);
        assert!(f.queue.inner.is_empty().await);
        assert_eq!(f.store.uploads().await, vec!["prefix/logs/job_1.log"]);
    }

    #[tokio::test]
    async fn transient_report_failure_is_kept() {
        let mut f = build_fixture(usize::MAX, false);
        let id = track(&mut f, "1", 0).await;

        f.tracker.update_job_status(&id, false).await;
        f.tracker.update_all().await;
        assert_eq!(f.tracker.unsettled_count(), 1);
    }

    #[tokio::test]
    async fn upload_gives_up_only_on_permanent_errors() {
        let transient: fn() -> FleetError = || FleetError::Store("503".into());
        let permanent: fn() -> FleetError = || FleetError::Config("no such bucket".into());
        for (error, unsettled) in [(transient, 1), (permanent, 0)] {
            let store = Arc::new(BrokenStore {
                error,
                attempts: AtomicUsize::new(0),
            });
            let mut f = fixture(0);
            f.tracker.store = store.clone() as Arc<dyn ObjectStore>;
            let id = track(&mut f, "1", 0).await;

            f.tracker.update_job_status(&id, false).await;
            f.tracker.update_all().await;
            assert_eq!(f.tracker.unsettled_count(), unsettled);
            assert_eq!(store.attempts.load(Ordering::SeqCst), 1 + unsettled);
        }
    }
}
