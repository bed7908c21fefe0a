//! Wire protocol shared by the Controller and the Workers.
//!
//! Two queues carry JSON payloads discriminated by a `type` field:
//! - the job queue carries [`Job`]s (`type: "job"`),
//! - the status queue carries [`StatusMessage`]s (`type: "job_status"`).
//!
//! Anything that fails to decode, or decodes to the wrong kind of payload,
//! surfaces as [`FleetError::MalformedMessage`](crate::error::FleetError).

pub mod job;
pub mod message;

pub use job::{BatchId, Job, JobId, JobSpec};
pub use message::{decode_job, decode_status, Message, RunState, StatusMessage};
