use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::store::BucketPath;

pub const ENV_INSTANCE_ID: &str = "EC2_INSTANCE_ID";
pub const ENV_DNS_NAME: &str = "EC2_DNS_NAME";
pub const ENV_JOBS_PER_INSTANCE: &str = "NUM_JOBS_PER_INSTANCE";

/// Object-store credentials handed to every bootstrapped instance.
#[derive(Clone, Default)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// What kind of instance to ask the provider for.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub image: String,
    pub instance_type: String,
    pub keypair: String,
    pub security_groups: Vec<String>,
}

impl InstanceSpec {
    pub fn new(image: impl Into<String>, keypair: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            instance_type: "m1.small".to_string(),
            keypair: keypair.into(),
            security_groups: vec!["default".to_string()],
        }
    }
}

/// Timing of the provisioning state machine.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub num_instances: usize,
    /// Wait after requesting instances before the first poll.
    pub startup_grace: Duration,
    pub poll_interval: Duration,
    /// Global deadline for all instances to become initialized.
    pub timeout: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            num_instances: 1,
            startup_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub instance: InstanceSpec,
    pub provisioning: ProvisioningConfig,
    /// Concurrency limit each Worker is started with.
    pub jobs_per_instance: usize,
    /// Whether Workers terminate their instance once the job queue runs dry.
    pub quit_when_done: bool,
    pub bucket: BucketPath,
    pub region_endpoint: String,
    pub credentials: Credentials,
}

impl ControllerConfig {
    pub fn new(instance: InstanceSpec, bucket: BucketPath) -> Self {
        Self {
            instance,
            provisioning: ProvisioningConfig::default(),
            jobs_per_instance: 1,
            quit_when_done: true,
            bucket,
            region_endpoint: String::new(),
            credentials: Credentials::default(),
        }
    }

    pub fn with_instances(mut self, num_instances: usize) -> Self {
        self.provisioning.num_instances = num_instances;
        self
    }

    pub fn with_jobs_per_instance(mut self, jobs_per_instance: usize) -> Self {
        self.jobs_per_instance = jobs_per_instance;
        self
    }

    /// Reject values that make a launch meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.instance.image.is_empty() {
            return Err(FleetError::Config("no image configured".into()));
        }
        if self.provisioning.num_instances == 0 {
            return Err(FleetError::Config("num_instances must be positive".into()));
        }
        if self.jobs_per_instance == 0 {
            return Err(FleetError::Config(
                "jobs_per_instance must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// How the Controller reaches a fresh instance over SSH.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub keypair_file: PathBuf,
    pub connect_timeout: Duration,
}

impl SshConfig {
    pub fn new(user: impl Into<String>, keypair_file: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            keypair_file: keypair_file.into(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Files delivered to every instance during bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapFiles {
    /// Template for the object-store client config, copied to `~/.s3cfg`.
    pub credentials_template: PathBuf,
    /// Template for the script that installs and starts the Worker.
    pub startup_template: PathBuf,
    pub application_script: Option<PathBuf>,
    pub cert_file: PathBuf,
    pub private_key_file: PathBuf,
}

/// Identity of the instance a Worker runs on, read from its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerIdentity {
    pub instance_id: String,
    pub dns_name: String,
    pub jobs_per_instance: usize,
}

impl WorkerIdentity {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    FleetError::Config(format!(
                        "could not obtain value from environment variable {}",
                        key
                    ))
                })
        };
        let dns_name = required(ENV_DNS_NAME)?;
        let instance_id = required(ENV_INSTANCE_ID)?;

        let jobs_per_instance = match lookup(ENV_JOBS_PER_INSTANCE) {
            None => {
                tracing::info!(
                    "{} not set, defaulting to 1 job per instance",
                    ENV_JOBS_PER_INSTANCE
                );
                1
            }
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(FleetError::Config(format!(
                        "{} must be a positive integer, got {:?}",
                        ENV_JOBS_PER_INSTANCE, raw
                    )))
                }
            },
        };

        Ok(Self {
            instance_id,
            dns_name,
            jobs_per_instance,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub identity: WorkerIdentity,
    /// Directory receiving the per-job log files.
    pub output_dir: PathBuf,
    pub bucket: BucketPath,
    /// Terminate the instance once idle for `idle_timeout`.
    pub quit_when_empty: bool,
    /// Sleep between polling cycles.
    pub cycle_interval: Duration,
    /// Bounded wait of a single job queue receive.
    pub receive_wait: Duration,
    pub idle_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(identity: WorkerIdentity, bucket: BucketPath) -> Self {
        Self {
            identity,
            output_dir: std::env::temp_dir(),
            bucket,
            quit_when_empty: false,
            cycle_interval: Duration::from_secs(60),
            receive_wait: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_quit_when_empty(mut self, quit_when_empty: bool) -> Self {
        self.quit_when_empty = quit_when_empty;
        self
    }

    pub fn with_intervals(
        mut self,
        cycle_interval: Duration,
        receive_wait: Duration,
        idle_timeout: Duration,
    ) -> Self {
        self.cycle_interval = cycle_interval;
        self.receive_wait = receive_wait;
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn jobs_per_instance(&self) -> usize {
        self.identity.jobs_per_instance
    }
}
