use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::protocol::job::Job;

/// Payload carried by the job and status queues, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Job(Job),
    JobStatus(StatusMessage),
}

impl Message {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| FleetError::Internal(e.to_string()))
    }

    pub fn decode(body: &str) -> Result<Self> {
        let message: Message =
            serde_json::from_str(body).map_err(|e| FleetError::MalformedMessage(e.to_string()))?;
        match &message {
            Message::Job(job) => job.validate()?,
            Message::JobStatus(status) => status.job.validate()?,
        }
        Ok(message)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Job(_) => "job",
            Message::JobStatus(_) => "job_status",
        }
    }
}

/// Decode a job queue body, rejecting anything that is not a job.
pub fn decode_job(body: &str) -> Result<Job> {
    match Message::decode(body)? {
        Message::Job(job) => Ok(job),
        other => Err(FleetError::MalformedMessage(format!(
            "expected a job payload, got {}",
            other.type_name()
        ))),
    }
}

/// Decode a status queue body, rejecting anything that is not a job status.
pub fn decode_status(body: &str) -> Result<StatusMessage> {
    match Message::decode(body)? {
        Message::JobStatus(status) => Ok(status),
        other => Err(FleetError::MalformedMessage(format!(
            "expected a job_status payload, got {}",
            other.type_name()
        ))),
    }
}

/// Execution state of a job. `ret_code` only exists once finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunState {
    Running,
    Finished { ret_code: i32 },
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Finished { .. } => write!(f, "finished"),
        }
    }
}

/// The mutable record of one job's execution progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(with = "tagged_job")]
    pub job: Job,
    pub instance: String,
    pub started_on: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub local_log_file: PathBuf,
    pub pid: Option<u32>,
    #[serde(flatten)]
    pub state: RunState,
}

impl StatusMessage {
    pub fn running(
        job: Job,
        instance: impl Into<String>,
        local_log_file: PathBuf,
        pid: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job,
            instance: instance.into(),
            started_on: now,
            last_update: now,
            local_log_file,
            pid,
            state: RunState::Running,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, RunState::Finished { .. })
    }

    pub fn ret_code(&self) -> Option<i32> {
        match self.state {
            RunState::Finished { ret_code } => Some(ret_code),
            RunState::Running => None,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_update = now;
    }

    /// Transition to `finished`. Returns false if already finished.
    pub fn finish(&mut self, ret_code: i32, now: DateTime<Utc>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.state = RunState::Finished { ret_code };
        self.last_update = now;
        true
    }

    pub fn encode(&self) -> Result<String> {
        Message::JobStatus(self.clone()).encode()
    }
}

/// The embedded job keeps its own `type: "job"` tag so it matches the job
/// queue schema.
mod tagged_job {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::protocol::job::Job;

    #[derive(Serialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum TaggedRef<'a> {
        Job(&'a Job),
    }

    #[derive(Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Tagged {
        Job(Job),
    }

    pub fn serialize<S: Serializer>(job: &Job, serializer: S) -> Result<S::Ok, S::Error> {
        TaggedRef::Job(job).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Job, D::Error> {
        let Tagged::Job(job) = Tagged::deserialize(deserializer)?;
        Ok(job)
    }
}
