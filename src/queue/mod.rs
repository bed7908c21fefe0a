//! At-least-once message queues with delete-on-receive semantics.
//!
//! A successful [`MessageQueue::receive`] removes the message, so a job is
//! claimed by at most one receiver. Delivery order is not preserved.

pub mod memory;
pub mod spool;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{decode_job, Job, Message};

pub use memory::InMemoryQueue;
pub use spool::SpoolQueue;

/// Identifies a posted message for later in-place updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle(String);

impl MessageHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub handle: MessageHandle,
    pub body: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn post(&self, body: String) -> Result<MessageHandle>;

    /// Wait up to `hold_time` for a message. The returned message has already
    /// been deleted from the queue.
    async fn receive(&self, hold_time: Duration) -> Result<Option<ReceivedMessage>>;

    /// Replace the body of a posted message. A message that has already been
    /// consumed is published again under the same handle.
    async fn update(&self, handle: &MessageHandle, body: String) -> Result<()>;
}

/// Outcome of trying to pull one job off the job queue.
#[derive(Debug)]
pub enum JobReceipt {
    Job(Job),
    Empty,
    /// A payload was consumed but could not be used as a job.
    Discarded,
}

pub async fn post_job(queue: &dyn MessageQueue, job: &Job) -> Result<MessageHandle> {
    let body = Message::Job(job.clone()).encode()?;
    let handle = queue.post(body).await?;
    tracing::debug!(
        job_id = %job.id(),
        batch_id = %job.batch_id(),
        queue = queue.name(),
        "Job posted"
    );
    Ok(handle)
}

pub async fn receive_job(queue: &dyn MessageQueue, hold_time: Duration) -> Result<JobReceipt> {
    let Some(message) = queue.receive(hold_time).await? else {
        return Ok(JobReceipt::Empty);
    };
    match decode_job(&message.body) {
        Ok(job) => {
            tracing::debug!(
                job_id = %job.id(),
                batch_id = %job.batch_id(),
                "Got job, removed work order from queue"
            );
            Ok(JobReceipt::Job(job))
        }
        Err(e) => {
            tracing::warn!(
                queue = queue.name(),
                handle = %message.handle,
                error = %e,
                "Discarding unusable message"
            );
            Ok(JobReceipt::Discarded)
        }
    }
}
