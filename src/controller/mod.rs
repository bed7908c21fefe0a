//! Control plane: posts jobs and provisions the instances that run them.
//!
//! A [`Controller`] can run in batch mode, accumulating jobs with
//! [`Controller::add_batch_job`] and posting them together under one batch
//! id, or post each job as it is added with [`Controller::add_job`].
//! [`Controller::launch`] posts the batch and then starts the instances.

pub mod jobs;
pub mod provisioning;

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::error::{FleetError, Result};
use crate::ids::IdGenerator;
use crate::protocol::{BatchId, Job, JobId, JobSpec};
use crate::provision::{Bootstrapper, ComputeProvisioner};
use crate::queue::MessageQueue;

pub use jobs::JobPoster;
pub use provisioning::{InstanceLauncher, InstancePhase, LaunchReport};

/// Collaborators a Controller talks to.
#[derive(Clone)]
pub struct ControllerServices {
    pub job_queue: Arc<dyn MessageQueue>,
    pub provisioner: Arc<dyn ComputeProvisioner>,
    pub bootstrapper: Arc<dyn Bootstrapper>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
}

pub struct Controller {
    poster: JobPoster,
    launcher: InstanceLauncher,
}

impl Controller {
    /// Validate the configuration against the provider and build a Controller.
    pub async fn connect(config: ControllerConfig, services: ControllerServices) -> Result<Self> {
        config.validate()?;
        if !services
            .provisioner
            .image_exists(&config.instance.image)
            .await?
        {
            return Err(FleetError::Config(format!(
                "cannot locate image by name: {}",
                config.instance.image
            )));
        }

        tracing::info!(
            image = %config.instance.image,
            instance_type = %config.instance.instance_type,
            instances = config.provisioning.num_instances,
            jobs_per_instance = config.jobs_per_instance,
            job_queue = services.job_queue.name(),
            "Controller ready"
        );

        Ok(Self {
            poster: JobPoster::new(services.job_queue, services.ids),
            launcher: InstanceLauncher::new(
                config,
                services.provisioner,
                services.bootstrapper,
                services.clock,
            ),
        })
    }

    pub fn add_batch_job(&mut self, spec: JobSpec) {
        self.poster.add_batch_job(spec);
    }

    pub async fn add_job(&self, spec: JobSpec, batch_id: Option<BatchId>) -> Result<Job> {
        self.poster.add_job(spec, batch_id).await
    }

    pub async fn post_jobs(&mut self, batch_id: Option<BatchId>) -> Result<(BatchId, Vec<JobId>)> {
        self.poster.post_jobs(batch_id).await
    }

    pub async fn start_instances(&self) -> Result<LaunchReport> {
        self.launcher.start_instances().await
    }

    /// Post the accumulated batch, then start and bootstrap the instances.
    pub async fn launch(&mut self) -> Result<LaunchReport> {
        let (batch_id, ids) = self.post_jobs(None).await?;
        tracing::info!(batch_id = %batch_id, jobs = ids.len(), "Launching");
        self.start_instances().await
    }
}
