use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{BootstrapFiles, SshConfig};
use crate::error::{FleetError, Result};
use crate::provision::bootstrap::{BootstrapParams, Bootstrapper, ScriptTemplate};
use crate::provision::InstanceHandle;

const REMOTE_CREDENTIALS: &str = "~/.s3cfg";
const REMOTE_CERT: &str = "/tmp/cert.pem";
const REMOTE_PRIVATE_KEY: &str = "/tmp/private_key.pem";
const REMOTE_STARTUP_SCRIPT: &str = "/tmp/start-worker.sh";
const REMOTE_APPLICATION_SCRIPT: &str = "/tmp/application-script.sh";
const REMOTE_STARTUP_LOG: &str = "/tmp/jobfleet-worker-startup.log";

/// Bootstraps instances with the system `ssh` and `scp` clients.
#[derive(Debug, Clone)]
pub struct SshBootstrapper {
    ssh: SshConfig,
    files: BootstrapFiles,
}

impl SshBootstrapper {
    pub fn new(ssh: SshConfig, files: BootstrapFiles) -> Self {
        Self { ssh, files }
    }

    fn host(&self, instance: &InstanceHandle) -> Result<String> {
        let dns = instance.public_dns_name().ok_or_else(|| FleetError::Bootstrap {
            instance: instance.id().to_string(),
            reason: "instance has no public address".into(),
        })?;
        Ok(format!("{}@{}", self.ssh.user, dns))
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-i".to_string(),
            self.ssh.keypair_file.display().to_string(),
        ]
    }

    async fn run(&self, instance: &InstanceHandle, program: &str, args: &[String]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FleetError::Bootstrap {
                instance: instance.id().to_string(),
                reason: format!("cannot run {}: {}", program, e),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(FleetError::Bootstrap {
                instance: instance.id().to_string(),
                reason: format!(
                    "{} exited with {:?}: {}",
                    program,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    async fn scp(&self, instance: &InstanceHandle, src: &Path, dest: &str) -> Result<()> {
        let mut args = self.base_args();
        args.push(src.display().to_string());
        args.push(format!("{}:{}", self.host(instance)?, dest));
        self.run(instance, "scp", &args).await
    }

    /// Run `cmd` detached on the instance, appending its output to `output_file`.
    async fn remote(&self, instance: &InstanceHandle, cmd: &str, output_file: &str) -> Result<()> {
        let mut args = self.base_args();
        args.push(self.host(instance)?);
        args.push(format!(
            "nohup {} >> {} 2>> {} < /dev/null &",
            cmd, output_file, output_file
        ));
        self.run(instance, "ssh", &args).await
    }

    async fn fill_and_copy(
        &self,
        instance: &InstanceHandle,
        template: &Path,
        vars: &BTreeMap<&'static str, String>,
        dest: &str,
    ) -> Result<()> {
        let rendered = ScriptTemplate::from_file(template).await?.fill(vars);
        // Removed when dropped, after the copy.
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(rendered.as_bytes())?;
        tmp.flush()?;
        self.scp(instance, tmp.path(), dest).await
    }
}

#[async_trait]
impl Bootstrapper for SshBootstrapper {
    async fn is_reachable(&self, instance: &InstanceHandle) -> bool {
        let Ok(host) = self.host(instance) else {
            return false;
        };
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.ssh.connect_timeout.as_secs().max(1)),
        ];
        args.extend(self.base_args());
        args.push(host);
        args.push("exit".to_string());

        match self.run(instance, "ssh", &args).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(instance_id = instance.id(), error = %e, "SSH not ready");
                false
            }
        }
    }

    async fn bootstrap(&self, instance: &InstanceHandle, params: &BootstrapParams) -> Result<()> {
        tracing::info!(
            instance_id = instance.id(),
            dns_name = instance.public_dns_name().unwrap_or_default(),
            "Initializing instance"
        );

        self.fill_and_copy(
            instance,
            &self.files.credentials_template,
            &params.credential_vars(),
            REMOTE_CREDENTIALS,
        )
        .await?;
        self.scp(instance, &self.files.cert_file, REMOTE_CERT).await?;
        self.scp(instance, &self.files.private_key_file, REMOTE_PRIVATE_KEY)
            .await?;

        let vars = params.template_vars();
        self.fill_and_copy(
            instance,
            &self.files.startup_template,
            &vars,
            REMOTE_STARTUP_SCRIPT,
        )
        .await?;
        self.remote(
            instance,
            &format!("chmod 500 {}", REMOTE_STARTUP_SCRIPT),
            "/dev/null",
        )
        .await?;

        if let Some(app_script) = &self.files.application_script {
            self.fill_and_copy(instance, app_script, &vars, REMOTE_APPLICATION_SCRIPT)
                .await?;
            self.remote(
                instance,
                &format!("chmod 500 {}", REMOTE_APPLICATION_SCRIPT),
                "/dev/null",
            )
            .await?;
        }

        self.remote(instance, REMOTE_STARTUP_SCRIPT, REMOTE_STARTUP_LOG)
            .await
    }
}
