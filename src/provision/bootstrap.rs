use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::config::ControllerConfig;
use crate::error::{FleetError, Result};
use crate::provision::InstanceHandle;

/// Delivers the startup payload to a freshly provisioned instance.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// `false` means "not reachable yet", never fatal.
    async fn is_reachable(&self, instance: &InstanceHandle) -> bool;

    /// Copy credentials, certificates and scripts over, then start the Worker.
    async fn bootstrap(&self, instance: &InstanceHandle, params: &BootstrapParams) -> Result<()>;
}

/// Values substituted into the bootstrap templates.
#[derive(Clone, PartialEq)]
pub struct BootstrapParams {
    pub access_key: String,
    pub secret_key: String,
    pub region_url: String,
    pub dns_name: String,
    pub instance_id: String,
    pub jobs_per_instance: usize,
    pub bucket: String,
    pub quit_when_empty: bool,
}

impl std::fmt::Debug for BootstrapParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapParams")
            .field("region_url", &self.region_url)
            .field("dns_name", &self.dns_name)
            .field("instance_id", &self.instance_id)
            .field("jobs_per_instance", &self.jobs_per_instance)
            .field("bucket", &self.bucket)
            .field("quit_when_empty", &self.quit_when_empty)
            .finish_non_exhaustive()
    }
}

impl BootstrapParams {
    pub fn for_instance(config: &ControllerConfig, instance: &InstanceHandle) -> Self {
        let region_url = if config.region_endpoint.contains("://") {
            config.region_endpoint.clone()
        } else {
            format!("http://{}", config.region_endpoint)
        };
        Self {
            access_key: config.credentials.access_key.clone(),
            secret_key: config.credentials.secret_key.clone(),
            region_url,
            dns_name: instance.public_dns_name().unwrap_or_default().to_string(),
            instance_id: instance.id().to_string(),
            jobs_per_instance: config.jobs_per_instance,
            bucket: config.bucket.to_string(),
            quit_when_empty: config.quit_when_done,
        }
    }

    /// Only the credentials, for the object-store client config.
    pub fn credential_vars(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("ACCESS_KEY", self.access_key.clone()),
            ("SECRET_KEY", self.secret_key.clone()),
        ])
    }

    pub fn template_vars(&self) -> BTreeMap<&'static str, String> {
        let mut vars = self.credential_vars();
        vars.extend([
            ("REGION_URL", self.region_url.clone()),
            ("DNS_NAME", self.dns_name.clone()),
            ("INSTANCE_ID", self.instance_id.clone()),
            ("NUM_JOBS_PER_INSTANCE", self.jobs_per_instance.to_string()),
            ("BUCKET", self.bucket.clone()),
            (
                "QUIT_WHEN_EMPTY",
                if self.quit_when_empty { "True" } else { "False" }.to_string(),
            ),
        ]);
        vars
    }
}

/// Text with `#NAME#` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptTemplate {
    template: String,
}

impl ScriptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let template = tokio::fs::read_to_string(path).await.map_err(|e| {
            FleetError::Config(format!("cannot read template {}: {}", path.display(), e))
        })?;
        Ok(Self::new(template))
    }

    /// Replace every `#NAME#` with its value. Unknown placeholders are left as is.
    pub fn fill<K: AsRef<str>>(&self, vars: &BTreeMap<K, String>) -> String {
        vars.iter().fold(self.template.clone(), |script, (name, value)| {
            script.replace(&format!("#{}#", name.as_ref()), value)
        })
    }
}
