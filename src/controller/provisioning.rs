use std::sync::Arc;

use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::error::{FleetError, Result};
use crate::provision::{
    BootstrapParams, Bootstrapper, ComputeProvisioner, InstanceHandle, InstanceState,
};

/// Where an instance is in the launch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Requested,
    Pending,
    /// Provider reports it running and it accepts an SSH connection.
    Ready,
    Initialized,
    /// Bootstrap failed; it is left alone.
    Failed,
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstancePhase::Requested => write!(f, "requested"),
            InstancePhase::Pending => write!(f, "pending"),
            InstancePhase::Ready => write!(f, "ready"),
            InstancePhase::Initialized => write!(f, "initialized"),
            InstancePhase::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of [`InstanceLauncher::start_instances`].
#[derive(Debug, Clone, Default)]
pub struct LaunchReport {
    pub requested: usize,
    pub initialized: Vec<InstanceHandle>,
    pub failed: Vec<InstanceHandle>,
    /// Still not ready when the deadline passed.
    pub timed_out: Vec<InstanceHandle>,
}

impl LaunchReport {
    pub fn started(&self) -> usize {
        self.initialized.len()
    }

    pub fn shortfall(&self) -> usize {
        self.requested - self.initialized.len()
    }

    pub fn is_complete(&self) -> bool {
        self.shortfall() == 0
    }
}

/// Starts, waits for and bootstraps the Worker instances.
pub struct InstanceLauncher {
    config: ControllerConfig,
    provisioner: Arc<dyn ComputeProvisioner>,
    bootstrapper: Arc<dyn Bootstrapper>,
    clock: Arc<dyn Clock>,
}

impl InstanceLauncher {
    pub fn new(
        config: ControllerConfig,
        provisioner: Arc<dyn ComputeProvisioner>,
        bootstrapper: Arc<dyn Bootstrapper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            provisioner,
            bootstrapper,
            clock,
        }
    }

    /// Start the configured number of instances and bootstrap each one.
    ///
    /// 1. Request every instance; a request that yields nothing aborts the launch
    /// 2. Wait out the startup grace period
    /// 3. Poll pending instances until they run and accept connections
    /// 4. Bootstrap each ready instance
    ///
    /// When the deadline passes first, the instances still pending are
    /// reported as timed out. That is not an error, and instances already
    /// initialized keep running.
    pub async fn start_instances(&self) -> Result<LaunchReport> {
        let settings = &self.config.provisioning;
        let deadline = self.clock.now() + settings.timeout;
        let mut report = LaunchReport {
            requested: settings.num_instances,
            ..LaunchReport::default()
        };

        tracing::info!(count = settings.num_instances, "Starting instances");
        let mut pending = Vec::with_capacity(settings.num_instances);
        for slot in 0..settings.num_instances {
            let instance = self.request(slot).await?;
            pending.push(instance);
        }

        tracing::info!(
            grace_secs = settings.startup_grace.as_secs(),
            "Giving the instances time to boot"
        );
        self.clock.sleep(settings.startup_grace).await;

        loop {
            let mut still_pending = Vec::with_capacity(pending.len());
            for mut instance in pending {
                if !self.is_ready(&mut instance).await {
                    still_pending.push(instance);
                    continue;
                }
                log_phase(&instance, InstancePhase::Ready);
                match self.initialize(&instance).await {
                    Ok(()) => {
                        log_phase(&instance, InstancePhase::Initialized);
                        report.initialized.push(instance);
                    }
                    Err(e) => {
                        tracing::error!(
                            instance_id = instance.id(),
                            error = %e,
                            "Instance failed to initialize"
                        );
                        log_phase(&instance, InstancePhase::Failed);
                        report.failed.push(instance);
                    }
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                break;
            }
            self.clock.sleep(settings.poll_interval).await;
            if self.clock.now() >= deadline {
                report.timed_out = pending;
                break;
            }
        }

        if report.timed_out.is_empty() {
            tracing::info!(
                started = report.started(),
                failed = report.failed.len(),
                "Instance launch finished"
            );
        } else {
            tracing::warn!(
                started = report.started(),
                requested = report.requested,
                timed_out = report.timed_out.len(),
                "Timed out waiting for instances, only some were started"
            );
        }
        Ok(report)
    }

    async fn request(&self, slot: usize) -> Result<InstanceHandle> {
        let spec = &self.config.instance;
        let handles = self.provisioner.start(spec).await.map_err(|e| match e {
            FleetError::Provisioning(_) => e,
            other => FleetError::Provisioning(other.to_string()),
        })?;
        let instance = handles.into_iter().next().ok_or_else(|| {
            FleetError::Provisioning(format!(
                "could not reserve instance {} of type {} from image {}",
                slot + 1,
                spec.instance_type,
                spec.image
            ))
        })?;
        log_phase(&instance, InstancePhase::Requested);
        log_phase(&instance, InstancePhase::Pending);
        Ok(instance)
    }

    async fn is_ready(&self, instance: &mut InstanceHandle) -> bool {
        match self.provisioner.poll_state(instance).await {
            Ok(InstanceState::Running) => self.bootstrapper.is_reachable(instance).await,
            Ok(state) => {
                tracing::debug!(instance_id = instance.id(), state = %state, "Instance not running yet");
                false
            }
            Err(e) => {
                tracing::warn!(instance_id = instance.id(), error = %e, "Failed to poll instance");
                false
            }
        }
    }

    async fn initialize(&self, instance: &InstanceHandle) -> Result<()> {
        let params = BootstrapParams::for_instance(&self.config, instance);
        self.bootstrapper.bootstrap(instance, &params).await
    }
}

fn log_phase(instance: &InstanceHandle, phase: InstancePhase) {
    tracing::debug!(
        instance_id = instance.id(),
        dns_name = instance.public_dns_name().unwrap_or_default(),
        phase = %phase,
        "Instance phase changed"
    );
}
