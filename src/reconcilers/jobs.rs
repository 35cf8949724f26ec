//! Pipeline steps backed by Kubernetes Jobs
//!
//! A job step creates its job once and is complete when the job reports a
//! success. Job names derive from the owner UID, so a restarted pipeline finds
//! the job it created before.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::info;

use crate::cluster::ClusterStore;
use crate::error::{Error, Result};
use crate::pipeline::Step;

/// Access to the job store of the namespace a pipeline runs in
pub trait JobContext: Send + Sync {
    fn jobs(&self) -> &dyn ClusterStore<Job>;
    fn namespace(&self) -> &str;
}

/// `{prefix}-{uid}`
pub fn job_name(prefix: &str, uid: &str) -> String {
    format!("{}-{}", prefix, uid)
}

/// Controller owner reference pointing at `owner`
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference> {
    owner
        .controller_owner_ref(&())
        .ok_or_else(|| Error::invalid(format!("{} has no uid", owner.name_any())))
}

/// UID of `owner`, required to name its jobs
pub fn owner_uid<K: Resource<DynamicType = ()>>(owner: &K) -> Result<String> {
    owner
        .uid()
        .ok_or_else(|| Error::invalid(format!("{} has no uid", owner.name_any())))
}

/// A claim mounted into a job container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimMount {
    pub claim_name: String,
    pub mount_path: String,
}

impl ClaimMount {
    pub fn new(claim_name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            claim_name: claim_name.into(),
            mount_path: mount_path.into(),
        }
    }
}

/// Settings shared by every job the operator launches
#[derive(Clone, Debug)]
pub struct JobSettings {
    pub image: String,
    pub service_account: String,
}

/// A single-completion job running `script` with bash
pub struct ScriptJob<'a> {
    pub name: String,
    pub namespace: &'a str,
    pub owner: OwnerReference,
    pub container: &'a str,
    pub script: String,
    pub mounts: Vec<ClaimMount>,
}

impl ScriptJob<'_> {
    pub fn build(self, settings: &JobSettings) -> Job {
        let volumes = self
            .mounts
            .iter()
            .map(|m| Volume {
                name: m.claim_name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: m.claim_name.clone(),
                    read_only: None,
                }),
                ..Default::default()
            })
            .collect();
        let volume_mounts = self
            .mounts
            .iter()
            .map(|m| VolumeMount {
                name: m.claim_name.clone(),
                mount_path: m.mount_path.clone(),
                ..Default::default()
            })
            .collect();

        Job {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace.to_string()),
                owner_references: Some(vec![self.owner]),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "threescale-operator".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(JobSpec {
                completions: Some(1),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: self.container.to_string(),
                            image: Some(settings.image.clone()),
                            command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
                            args: Some(vec![self.script]),
                            volume_mounts: Some(volume_mounts),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        restart_policy: Some("OnFailure".to_string()),
                        service_account_name: Some(settings.service_account.clone()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

/// Outcome of a job as reported by its status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
}

pub fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = &job.status else {
        return JobOutcome::Running;
    };
    let failed = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Failed" && c.status == "True");
    if failed {
        JobOutcome::Failed
    } else if status.succeeded.unwrap_or(0) >= 1 {
        JobOutcome::Succeeded
    } else {
        JobOutcome::Running
    }
}

/// Step running one job
pub struct JobStep<C> {
    id: &'static str,
    build: fn(&C) -> Result<Job>,
    applies: fn(&C) -> bool,
}

impl<C> JobStep<C> {
    pub fn new(id: &'static str, build: fn(&C) -> Result<Job>) -> Self {
        Self {
            id,
            build,
            applies: |_| true,
        }
    }

    /// Only run when `applies` holds; otherwise the step counts as complete
    pub fn when(mut self, applies: fn(&C) -> bool) -> Self {
        self.applies = applies;
        self
    }
}

#[async_trait]
impl<C: JobContext> Step<C> for JobStep<C> {
    fn identifier(&self) -> &str {
        self.id
    }

    async fn execute(&self, ctx: &mut C) -> Result<Option<Duration>> {
        let job = (self.build)(ctx)?;
        let name = job.name_any();
        if ctx.jobs().get(ctx.namespace(), &name).await?.is_none() {
            ctx.jobs().create(ctx.namespace(), &job).await?;
            info!(job = %name, step = self.id, "Job created");
        }
        Ok(None)
    }

    async fn completed(&self, ctx: &C) -> Result<bool> {
        if !(self.applies)(ctx) {
            return Ok(true);
        }
        let name = (self.build)(ctx)?.name_any();
        match ctx.jobs().get(ctx.namespace(), &name).await? {
            None => Ok(false),
            Some(job) => match job_outcome(&job) {
                JobOutcome::Succeeded => Ok(true),
                JobOutcome::Running => Ok(false),
                JobOutcome::Failed => Err(Error::JobFailed(name)),
            },
        }
    }
}
