use async_trait::async_trait;
use tokio::process::Command;

use crate::config::InstanceSpec;
use crate::error::{FleetError, Result};
use crate::provision::{ComputeProvisioner, InstanceHandle, InstanceState};

/// The machine this process runs on, seen as a single running instance.
///
/// It cannot start new instances. Terminating runs the configured shutdown
/// command, or only logs when none is set.
#[derive(Debug, Clone, Default)]
pub struct LocalHost {
    shutdown_command: Option<Vec<String>>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shutdown_command(mut self, command: Vec<String>) -> Self {
        self.shutdown_command = Some(command).filter(|c| !c.is_empty());
        self
    }
}

#[async_trait]
impl ComputeProvisioner for LocalHost {
    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(false)
    }

    async fn start(&self, _spec: &InstanceSpec) -> Result<Vec<InstanceHandle>> {
        Err(FleetError::Provisioning(
            "the local host cannot start instances".into(),
        ))
    }

    async fn poll_state(&self, _instance: &mut InstanceHandle) -> Result<InstanceState> {
        Ok(InstanceState::Running)
    }

    async fn terminate(&self, instance: &InstanceHandle) -> Result<()> {
        let Some(command) = &self.shutdown_command else {
            tracing::info!(
                instance_id = instance.id(),
                "No shutdown command configured, leaving host running"
            );
            return Ok(());
        };

        tracing::info!(
            instance_id = instance.id(),
            command = %command.join(" "),
            "Shutting down host"
        );
        let status = Command::new(&command[0])
            .args(&command[1..])
            .status()
            .await
            .map_err(|e| FleetError::Process(format!("{}: {}", command[0], e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(FleetError::Process(format!(
                "shutdown command exited with {:?}",
                status.code()
            )))
        }
    }
}
