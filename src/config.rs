//! Operator configuration, read from the environment

use std::collections::HashMap;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::{Error, Result};

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Port of the metrics and health endpoints
    #[envconfig(from = "METRICS_PORT", default = "8080")]
    pub metrics_port: u16,

    /// Delay before re-checking an incomplete pipeline step
    #[envconfig(from = "PIPELINE_REQUEUE_SECONDS", default = "5")]
    pub pipeline_requeue_seconds: u64,

    /// Delay before retrying a resource waiting on a dependency
    #[envconfig(from = "WAIT_REQUEUE_SECONDS", default = "5")]
    pub wait_requeue_seconds: u64,

    #[envconfig(from = "TRANSIENT_REQUEUE_SECONDS", default = "30")]
    pub transient_requeue_seconds: u64,

    #[envconfig(from = "ORPHAN_REQUEUE_SECONDS", default = "60")]
    pub orphan_requeue_seconds: u64,

    /// Upper bound of the doubling retry delay after repeated failures
    #[envconfig(from = "MAX_BACKOFF_SECONDS", default = "600")]
    pub max_backoff_seconds: u64,

    /// Interval between binding passes when nothing changed
    #[envconfig(from = "BINDING_RESYNC_SECONDS", default = "300")]
    pub binding_resync_seconds: u64,

    /// Secret used when a resource names no provider account
    #[envconfig(
        from = "DEFAULT_PROVIDER_ACCOUNT_SECRET",
        default = "threescale-provider-account"
    )]
    pub default_provider_account_secret: String,

    /// Image with the `oc` CLI used by backup and restore jobs
    #[envconfig(from = "JOB_IMAGE", default = "quay.io/openshift/origin-cli:4.7")]
    pub job_image: String,

    /// Service account the backup and restore jobs run as
    #[envconfig(from = "JOB_SERVICE_ACCOUNT", default = "3scale-operator")]
    pub job_service_account: String,

    #[envconfig(from = "FIELD_MANAGER", default = "threescale-operator")]
    pub field_manager: String,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        Self::init_from_env().map_err(|e| Error::config(e.to_string()))
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::init_from_hashmap(vars).map_err(|e| Error::config(e.to_string()))
    }

    pub fn pipeline_requeue(&self) -> Duration {
        Duration::from_secs(self.pipeline_requeue_seconds)
    }

    pub fn wait_requeue(&self) -> Duration {
        Duration::from_secs(self.wait_requeue_seconds)
    }

    pub fn transient_requeue(&self) -> Duration {
        Duration::from_secs(self.transient_requeue_seconds)
    }

    pub fn orphan_requeue(&self) -> Duration {
        Duration::from_secs(self.orphan_requeue_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn binding_resync(&self) -> Duration {
        Duration::from_secs(self.binding_resync_seconds)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: 8080,
            pipeline_requeue_seconds: 5,
            wait_requeue_seconds: 5,
            transient_requeue_seconds: 30,
            orphan_requeue_seconds: 60,
            max_backoff_seconds: 600,
            binding_resync_seconds: 300,
            default_provider_account_secret: "threescale-provider-account".to_string(),
            job_image: "quay.io/openshift/origin-cli:4.7".to_string(),
            job_service_account: "3scale-operator".to_string(),
            field_manager: "threescale-operator".to_string(),
        }
    }
}
