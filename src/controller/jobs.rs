use std::sync::Arc;

use crate::error::Result;
use crate::ids::{random_batch_id, IdGenerator};
use crate::protocol::{BatchId, Job, JobId, JobSpec};
use crate::queue::{post_job, MessageQueue};

/// Posts jobs to the job queue, either one by one or as an accumulated batch.
pub struct JobPoster {
    job_queue: Arc<dyn MessageQueue>,
    ids: Arc<dyn IdGenerator>,
    batch: Vec<JobSpec>,
}

impl JobPoster {
    pub fn new(job_queue: Arc<dyn MessageQueue>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            job_queue,
            ids,
            batch: Vec::new(),
        }
    }

    /// Hold a job locally until [`JobPoster::post_jobs`].
    pub fn add_batch_job(&mut self, spec: JobSpec) {
        self.batch.push(spec);
    }

    /// Post a single job right away, skipping the local batch.
    pub async fn add_job(&self, spec: JobSpec, batch_id: Option<BatchId>) -> Result<Job> {
        let batch_id = batch_id.unwrap_or_else(random_batch_id);
        self.post_job(spec, batch_id).await
    }

    /// Post every held job under one batch id, generated when not given.
    ///
    /// Jobs that were posted stay posted if a later one fails; the failed one
    /// and everything after it remain held.
    pub async fn post_jobs(&mut self, batch_id: Option<BatchId>) -> Result<(BatchId, Vec<JobId>)> {
        let batch_id = batch_id.unwrap_or_else(random_batch_id);
        let mut posted = Vec::with_capacity(self.batch.len());

        while let Some(spec) = self.batch.first().cloned() {
            let job = self.post_job(spec, batch_id.clone()).await?;
            self.batch.remove(0);
            posted.push(job.id().clone());
        }

        tracing::info!(batch_id = %batch_id, jobs = posted.len(), "Batch posted");
        Ok((batch_id, posted))
    }

    /// Assign an id and post. The id is fixed before the job is ever sent.
    pub async fn post_job(&self, spec: JobSpec, batch_id: BatchId) -> Result<Job> {
        let job = spec.into_job(self.ids.next_job_id(), batch_id);
        post_job(self.job_queue.as_ref(), &job).await?;
        Ok(job)
    }
}
