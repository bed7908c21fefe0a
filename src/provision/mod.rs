//! Compute provider abstraction.
//!
//! The Controller starts instances through a [`ComputeProvisioner`], waits for
//! them to run and be reachable through a [`Bootstrapper`], then bootstraps them. A
//! Worker uses the same trait to terminate its own instance.

pub mod bootstrap;
pub mod local;
pub mod ssh;

use async_trait::async_trait;

use crate::config::InstanceSpec;
use crate::error::Result;

pub use bootstrap::{BootstrapParams, Bootstrapper, ScriptTemplate};
pub use local::LocalHost;
pub use ssh::SshBootstrapper;

/// A started instance, as last seen by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    id: String,
    public_dns_name: Option<String>,
}

impl InstanceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            public_dns_name: None,
        }
    }

    pub fn with_public_dns_name(mut self, dns_name: impl Into<String>) -> Self {
        self.public_dns_name = Some(dns_name.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Public address; providers usually assign it once the instance runs.
    pub fn public_dns_name(&self) -> Option<&str> {
        self.public_dns_name.as_deref()
    }

    pub fn set_public_dns_name(&mut self, dns_name: Option<String>) {
        self.public_dns_name = dns_name;
    }
}

/// Provider-reported run state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Other(String),
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::ShuttingDown => write!(f, "shutting-down"),
            InstanceState::Terminated => write!(f, "terminated"),
            InstanceState::Other(s) => write!(f, "{}", s),
        }
    }
}

#[async_trait]
pub trait ComputeProvisioner: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Request one instance. An empty result means the provider could not
    /// reserve anything.
    async fn start(&self, spec: &InstanceSpec) -> Result<Vec<InstanceHandle>>;

    /// Fetch the current state, refreshing the handle's public address.
    async fn poll_state(&self, instance: &mut InstanceHandle) -> Result<InstanceState>;

    async fn terminate(&self, instance: &InstanceHandle) -> Result<()>;
}
