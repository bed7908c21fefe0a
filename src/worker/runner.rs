use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::error::{FleetError, Result};
use crate::protocol::Job;
use crate::provision::{ComputeProvisioner, InstanceHandle};
use crate::queue::{receive_job, JobReceipt, MessageQueue};
use crate::store::ObjectStore;
use crate::worker::executor::{ChildProcess, FailedLaunch, ProcessLauncher, LAUNCH_FAILURE_CODE};
use crate::worker::status::StatusTracker;

/// Collaborators a Worker talks to.
#[derive(Clone)]
pub struct WorkerServices {
    pub job_queue: Arc<dyn MessageQueue>,
    pub status_queue: Arc<dyn MessageQueue>,
    pub store: Arc<dyn ObjectStore>,
    pub provisioner: Arc<dyn ComputeProvisioner>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub clock: Arc<dyn Clock>,
}

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue stayed empty with nothing running; the instance was asked
    /// to terminate.
    Drained,
    /// Shutdown was requested; running jobs were waited for.
    Cancelled,
}

/// What one receive pass over the job queue observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceivePass {
    /// Every free slot was filled, or there were no free slots.
    Filled,
    /// The queue had nothing to hand out.
    QueueEmpty,
    /// Receiving failed; the queue state is unknown.
    Failed,
}

/// The per-instance agent: claims jobs, runs them and reports on them.
pub struct Worker {
    config: WorkerConfig,
    job_queue: Arc<dyn MessageQueue>,
    provisioner: Arc<dyn ComputeProvisioner>,
    launcher: Arc<dyn ProcessLauncher>,
    clock: Arc<dyn Clock>,
    tracker: StatusTracker,
    idle_since: Option<Instant>,
}

impl Worker {
    pub fn new(config: WorkerConfig, services: WorkerServices) -> Result<Self> {
        if config.jobs_per_instance() == 0 {
            return Err(FleetError::Config(
                "jobs per instance must be positive".into(),
            ));
        }
        if !config.output_dir.is_dir() {
            return Err(FleetError::Config(format!(
                "log directory {} does not exist",
                config.output_dir.display()
            )));
        }
        let tracker = StatusTracker::new(
            config.identity.instance_id.clone(),
            config.bucket.clone(),
            services.status_queue,
            services.store,
            services.clock.clone(),
        );
        Ok(Self {
            config,
            job_queue: services.job_queue,
            provisioner: services.provisioner,
            launcher: services.launcher,
            clock: services.clock,
            tracker,
            idle_since: None,
        })
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Poll until drained (quit-when-empty only) or until `shutdown` fires.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<WorkerExit> {
        tracing::info!(
            instance_id = %self.config.identity.instance_id,
            dns_name = %self.config.identity.dns_name,
            jobs_per_instance = self.config.jobs_per_instance(),
            job_queue = self.job_queue.name(),
            bucket = %self.config.bucket,
            quit_when_empty = self.config.quit_when_empty,
            "Worker started"
        );

        loop {
            if shutdown.is_cancelled() {
                return self.shut_down().await;
            }

            self.run_cycle().await;

            if self.should_quit() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => return self.shut_down().await,
                _ = self.clock.sleep(self.config.cycle_interval) => {}
            }
        }

        tracing::info!("No jobs found, waiting for current jobs to complete");
        self.tracker.finish_all().await;

        let own = InstanceHandle::new(self.config.identity.instance_id.clone())
            .with_public_dns_name(self.config.identity.dns_name.clone());
        tracing::info!(instance_id = own.id(), "All jobs completed, terminating instance");
        self.provisioner.terminate(&own).await?;
        Ok(WorkerExit::Drained)
    }

    /// One polling cycle: advance active jobs, then fill free slots.
    pub async fn run_cycle(&mut self) {
        self.tracker.update_all().await;

        let pass = self.fill_slots().await;
        let idle = pass == ReceivePass::QueueEmpty && self.tracker.active_count() == 0;
        if idle {
            self.idle_since.get_or_insert_with(|| self.clock.now());
        } else {
            self.idle_since = None;
        }
    }

    fn should_quit(&self) -> bool {
        self.config.quit_when_empty
            && self
                .idle_since
                .is_some_and(|since| self.clock.now() - since >= self.config.idle_timeout)
    }

    async fn fill_slots(&mut self) -> ReceivePass {
        let limit = self.config.jobs_per_instance();
        while self.tracker.active_count() < limit {
            match receive_job(self.job_queue.as_ref(), self.config.receive_wait).await {
                Ok(JobReceipt::Job(job)) => self.start_job(job).await,
                Ok(JobReceipt::Discarded) => continue,
                Ok(JobReceipt::Empty) => return ReceivePass::QueueEmpty,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to receive from job queue");
                    return ReceivePass::Failed;
                }
            }
        }
        ReceivePass::Filled
    }

    async fn start_job(&mut self, job: Job) {
        let log_path = self.config.output_dir.join(job.log_file_name());
        tracing::info!(
            job_id = %job.id(),
            batch_id = %job.batch_id(),
            command = %job.command().join(" "),
            log_file = %log_path.display(),
            "Starting job"
        );

        let (child, log_file) = match open_log(&log_path).await {
            Ok(file) => (self.launch(&job, &file, &log_path), Some(file)),
            Err(e) => {
                tracing::error!(
                    job_id = %job.id(),
                    log_file = %log_path.display(),
                    error = %e,
                    "Cannot open log file"
                );
                let failed: Box<dyn ChildProcess> =
                    Box::new(FailedLaunch::new(LAUNCH_FAILURE_CODE));
                (failed, None)
            }
        };

        self.tracker.track(job, child, log_file, log_path).await;
    }

    fn launch(&self, job: &Job, mut log: &File, log_path: &Path) -> Box<dyn ChildProcess> {
        match self.launcher.launch(job.command(), log) {
            Ok(child) => {
                tracing::debug!(job_id = %job.id(), pid = ?child.pid(), "Process started");
                child
            }
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Failed to start job command");
                if let Err(write_err) = writeln!(
                    log,
                    "failed to start {:?}: {}",
                    job.command().join(" "),
                    e
                ) {
                    tracing::warn!(
                        log_file = %log_path.display(),
                        error = %write_err,
                        "Cannot record launch failure"
                    );
                }
                Box::new(FailedLaunch::new(LAUNCH_FAILURE_CODE))
            }
        }
    }

    async fn shut_down(&mut self) -> Result<WorkerExit> {
        tracing::info!(
            running = self.tracker.active_count(),
            "Shutdown requested, waiting for running jobs"
        );
        self.tracker.finish_all().await;
        Ok(WorkerExit::Cancelled)
    }
}

async fn open_log(path: &Path) -> std::io::Result<File> {
    let file = tokio::fs::File::create(path).await?;
    Ok(file.into_std().await)
}
