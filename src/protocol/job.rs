use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Placeholder replaced by the job id in a log file template.
pub const LOG_ID_PLACEHOLDER: &str = "%d";

pub const DEFAULT_LOG_FILE_TEMPLATE: &str = "job_%d.log";

/// `expected_runtime` value meaning "unknown".
pub const UNKNOWN_RUNTIME: i64 = -1;

/// Opaque job id. Producers that number their jobs may send an integer; it is
/// kept as its decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireId {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match WireId::deserialize(deserializer)? {
            WireId::Text(id) => JobId(id),
            WireId::Signed(n) => JobId(n.to_string()),
            WireId::Unsigned(n) => JobId(n.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work that has not been posted yet, so it has no id or batch.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    command: Vec<String>,
    num_cpus: u32,
    expected_runtime: i64,
    log_file_template: String,
}

impl JobSpec {
    pub fn new<I, S>(command: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        if command.is_empty() {
            return Err(FleetError::Config("job command must not be empty".into()));
        }
        Ok(Self {
            command,
            num_cpus: 1,
            expected_runtime: UNKNOWN_RUNTIME,
            log_file_template: DEFAULT_LOG_FILE_TEMPLATE.to_string(),
        })
    }

    pub fn with_num_cpus(mut self, num_cpus: u32) -> Result<Self> {
        if num_cpus == 0 {
            return Err(FleetError::Config("num_cpus must be positive".into()));
        }
        self.num_cpus = num_cpus;
        Ok(self)
    }

    pub fn with_expected_runtime(mut self, seconds: i64) -> Self {
        self.expected_runtime = seconds;
        self
    }

    pub fn with_log_file_template(mut self, template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        validate_log_template(&template).map_err(FleetError::Config)?;
        self.log_file_template = template;
        Ok(self)
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Assign identity. This is the only way a [`Job`] comes into existence
    /// locally, which keeps its id immutable once posted.
    pub fn into_job(self, id: JobId, batch_id: BatchId) -> Job {
        Job {
            id,
            batch_id,
            command: self.command,
            num_cpus: self.num_cpus,
            expected_runtime: self.expected_runtime,
            log_file_template: self.log_file_template,
        }
    }
}

/// A posted job. Fields are read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    command: Vec<String>,
    num_cpus: u32,
    expected_runtime: i64,
    log_file_template: String,
    batch_id: BatchId,
}

impl Job {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn num_cpus(&self) -> u32 {
        self.num_cpus
    }

    pub fn expected_runtime(&self) -> Option<Duration> {
        u64::try_from(self.expected_runtime)
            .ok()
            .map(Duration::from_secs)
    }

    pub fn log_file_template(&self) -> &str {
        &self.log_file_template
    }

    /// File name of this job's log, e.g. `job_%d.log` -> `job_<id>.log`.
    pub fn log_file_name(&self) -> String {
        self.log_file_template
            .replacen(LOG_ID_PLACEHOLDER, self.id.as_str(), 1)
    }

    /// Check the field rules a decoded job must satisfy.
    pub fn validate(&self) -> Result<()> {
        let malformed = |reason: String| {
            FleetError::MalformedMessage(format!("job {}: {}", self.id, reason))
        };
        if self.id.as_str().is_empty() {
            return Err(FleetError::MalformedMessage("job id is empty".into()));
        }
        if self.id.as_str().contains(['/', '\\']) || self.id.as_str() == ".." {
            return Err(malformed("id must not contain path separators".into()));
        }
        if self.command.is_empty() {
            return Err(malformed("command is empty".into()));
        }
        if self.num_cpus == 0 {
            return Err(malformed("num_cpus must be positive".into()));
        }
        validate_log_template(&self.log_file_template).map_err(malformed)?;
        Ok(())
    }
}

fn validate_log_template(template: &str) -> std::result::Result<(), String> {
    let count = template.matches(LOG_ID_PLACEHOLDER).count();
    if count != 1 {
        return Err(format!(
            "log file template {:?} must contain exactly one {} placeholder, found {}",
            template, LOG_ID_PLACEHOLDER, count
        ));
    }
    if template.contains(['/', '\\']) {
        return Err(format!(
            "log file template {:?} must be a bare file name",
            template
        ));
    }
    Ok(())
}
