//! APIManagerRestore pipelines
//!
//! The main pipeline restores secrets, configmaps and system files from a
//! backup claim, recreates the APIManager and waits for it to become ready.
//! The post pipeline removes the jobs the main pipeline launched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Secret, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use crate::clock::Clock;
use crate::cluster::ClusterStore;
use crate::crd::{APIManager, APIManagerRestore, APIManagerRestoreStatus};
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineBuilder, Step};

use super::backup::{
    uses_pvc_file_storage, BACKED_UP_CONFIGMAPS, BACKED_UP_SECRETS, SERIALIZED_APIMANAGER_FILE,
    SYSTEM_STORAGE_MOUNT_PATH, SYSTEM_STORAGE_PVC,
};
use super::jobs::{
    job_name, owner_reference, owner_uid, ClaimMount, JobContext, JobSettings, JobStep, ScriptJob,
};

pub const RESTORE_MOUNT_PATH: &str = "/backup";

const RESTORE_SECRETS_JOB: &str = "restore-cfgmaps-secrets";
const RESTORE_SYSTEM_STORAGE_JOB: &str = "restore-system-fs";
const SHARE_APIMANAGER_JOB: &str = "restore-apm-tosecret";
const RESYNC_DOMAINS_JOB: &str = "resync-domains";

/// Jobs removed once the main steps are done
pub const RESTORE_JOB_PREFIXES: [&str; 4] = [
    RESTORE_SECRETS_JOB,
    RESTORE_SYSTEM_STORAGE_JOB,
    SHARE_APIMANAGER_JOB,
    RESYNC_DOMAINS_JOB,
];

/// State of one restore pass
pub struct RestoreContext {
    pub restore: APIManagerRestore,
    pub namespace: String,
    pub api_managers: Arc<dyn ClusterStore<APIManager>>,
    pub restores: Arc<dyn ClusterStore<APIManagerRestore>>,
    pub jobs: Arc<dyn ClusterStore<Job>>,
    pub claims: Arc<dyn ClusterStore<PersistentVolumeClaim>>,
    pub secrets: Arc<dyn ClusterStore<Secret>>,
    pub clock: Arc<dyn Clock>,
    pub settings: JobSettings,
    /// Delay before re-checking a dependency that is not there yet
    pub wait_requeue: Duration,
    /// The APIManager being restored, once read from the backup
    pub to_restore: Option<APIManager>,
}

impl JobContext for RestoreContext {
    fn jobs(&self) -> &dyn ClusterStore<Job> {
        self.jobs.as_ref()
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl RestoreContext {
    pub fn status(&self) -> APIManagerRestoreStatus {
        self.restore.status.clone().unwrap_or_default()
    }

    /// Name of the secret the serialized APIManager is shared through
    pub fn shared_secret_name(&self) -> String {
        format!("{}-serialized-apimanager", self.restore.name_any())
    }

    pub fn source_claim(&self) -> Result<String> {
        self.restore
            .spec
            .restore_source
            .persistent_volume_claim
            .as_ref()
            .map(|c| c.claim_name.clone())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::invalid("restoreSource.persistentVolumeClaim.claimName is required"))
    }

    /// Read the APIManager to restore from the shared secret, or from the cluster once recreated
    pub async fn load(&mut self) -> Result<()> {
        let Some(name) = self.status().api_manager_to_restore_ref else {
            return Ok(());
        };
        self.to_restore = match self.read_shared_secret().await? {
            Some(api_manager) => Some(api_manager),
            None => self.api_managers.get(&self.namespace, &name).await?,
        };
        Ok(())
    }

    async fn read_shared_secret(&self) -> Result<Option<APIManager>> {
        let Some(secret) = self
            .secrets
            .get(&self.namespace, &self.shared_secret_name())
            .await?
        else {
            return Ok(None);
        };
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(SERIALIZED_APIMANAGER_FILE))
            .ok_or_else(|| Error::SecretKeyNotFound {
                secret: self.shared_secret_name(),
                key: SERIALIZED_APIMANAGER_FILE.to_string(),
            })?;
        Ok(Some(serde_json::from_slice(&bytes.0)?))
    }

    pub async fn save_status(&mut self, change: impl FnOnce(&mut APIManagerRestoreStatus)) -> Result<()> {
        let mut updated = self.restore.clone();
        let mut status = self.status();
        change(&mut status);
        updated.status = Some(status);
        self.restore = self.restores.update_status(&self.namespace, &updated).await?;
        Ok(())
    }

    fn restores_system_storage(&self) -> bool {
        self.to_restore.as_ref().map(uses_pvc_file_storage).unwrap_or(false)
    }

    fn script_job(&self, prefix: &str, container: &str, script: String, mounts: Vec<ClaimMount>) -> Result<Job> {
        Ok(ScriptJob {
            name: job_name(prefix, &owner_uid(&self.restore)?),
            namespace: &self.namespace,
            owner: owner_reference(&self.restore)?,
            container,
            script,
            mounts,
        }
        .build(&self.settings))
    }

    /// Claim holding system files, sized like the one the APIManager creates
    pub fn system_storage_claim(&self) -> PersistentVolumeClaim {
        let storage_class = self
            .to_restore
            .as_ref()
            .and_then(|a| a.spec.fields.get("system"))
            .and_then(|s| s.pointer("/fileStorage/persistentVolumeClaim/storageClassName"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(SYSTEM_STORAGE_PVC.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                storage_class_name: storage_class,
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("100Mi".to_string()),
                    )])),
                    limits: None,
                }),
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn restore_secrets_job(ctx: &RestoreContext) -> Result<Job> {
    let script = format!(
        r#"
SECRETS='{secrets}';
CONFIGMAPS='{configmaps}';
BASEPATH='{base}';
for i in $(echo -n $SECRETS); do
  res=$(oc get secret ${{i}} --ignore-not-found=true)
  if [ -z "${{res}}" ]; then
    oc create -f ${{BASEPATH}}/secrets/${{i}}.json
  else
    echo "Secret ${{i}} already exists. Skipping restore of the secret"
  fi
done;

for i in $(echo -n $CONFIGMAPS); do
  res=$(oc get configmap ${{i}} --ignore-not-found=true);
  if [ -z "${{res}}" ]; then
    oc create -f ${{BASEPATH}}/configmaps/${{i}}.json;
  else
    echo "ConfigMap '${{i}}' already exists. Skipping restore of the ConfigMap";
  fi
done;
"#,
        secrets = BACKED_UP_SECRETS.join(" "),
        configmaps = BACKED_UP_CONFIGMAPS.join(" "),
        base = RESTORE_MOUNT_PATH,
    );
    ctx.script_job(
        RESTORE_SECRETS_JOB,
        RESTORE_SECRETS_JOB,
        script,
        vec![ClaimMount::new(ctx.source_claim()?, RESTORE_MOUNT_PATH)],
    )
}

fn share_api_manager_job(ctx: &RestoreContext) -> Result<Job> {
    let script = format!(
        r#"
BASEPATH='{base}';
APIMANAGER_BACKUP_SUBDIR="${{BASEPATH}}/apimanager";
SECRET_TO_SHARE='{secret}';
APIMANAGER_BACKUP_FILENAME="{file}";
oc create secret generic ${{SECRET_TO_SHARE}} --from-file=${{APIMANAGER_BACKUP_SUBDIR}}/${{APIMANAGER_BACKUP_FILENAME}};
"#,
        base = RESTORE_MOUNT_PATH,
        secret = ctx.shared_secret_name(),
        file = SERIALIZED_APIMANAGER_FILE,
    );
    ctx.script_job(
        SHARE_APIMANAGER_JOB,
        "job",
        script,
        vec![ClaimMount::new(ctx.source_claim()?, RESTORE_MOUNT_PATH)],
    )
}

fn restore_system_storage_job(ctx: &RestoreContext) -> Result<Job> {
    // rsync -a would try to change attributes of the mounted volume root
    let script = format!(
        r#"
BASEPATH='{base}';
SYSTEM_FILESTORAGE_PVC_DIR='{storage}'
PVC_BACKUP_FILESTORAGE_SUBDIR="${{BASEPATH}}/system-filestorage-pvc";
rsync -rlv ${{PVC_BACKUP_FILESTORAGE_SUBDIR}}/* ${{SYSTEM_FILESTORAGE_PVC_DIR}}/;
"#,
        base = RESTORE_MOUNT_PATH,
        storage = SYSTEM_STORAGE_MOUNT_PATH,
    );
    ctx.script_job(
        RESTORE_SYSTEM_STORAGE_JOB,
        "restore-system-filestorage-pvc",
        script,
        vec![
            ClaimMount::new(ctx.source_claim()?, RESTORE_MOUNT_PATH),
            ClaimMount::new(SYSTEM_STORAGE_PVC, SYSTEM_STORAGE_MOUNT_PATH),
        ],
    )
}

fn resync_domains_job(ctx: &RestoreContext) -> Result<Job> {
    let script = r#"
dcname="system-sidekiq"
dcpods=$(oc get pods --ignore-not-found=true -l deploymentconfig=${dcname} --no-headers=true -o custom-columns=:metadata.name)
if [ -z "${dcpods}" ]; then
  echo "No pods found for Deployment ${dcname}"
  exit 1
fi
podname=$(echo -n $dcpods | awk '{print $1}')
oc exec ${podname} bash -- -c "bundle exec rake zync:resync:domains"
"#;
    ctx.script_job(RESYNC_DOMAINS_JOB, "job", script.to_string(), vec![])
}

// ============================================================================
// Main steps
// ============================================================================

pub struct StartTime;

#[async_trait]
impl Step<RestoreContext> for StartTime {
    fn identifier(&self) -> &str {
        "StartTime"
    }

    async fn execute(&self, ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        let now = ctx.clock.now();
        ctx.save_status(|s| s.start_time = Some(now)).await?;
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        Ok(ctx.status().start_time.is_some())
    }
}

/// Records which APIManager the backup holds
pub struct ApiManagerRef;

#[async_trait]
impl Step<RestoreContext> for ApiManagerRef {
    fn identifier(&self) -> &str {
        "ApiManagerRef"
    }

    async fn execute(&self, ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        let Some(api_manager) = ctx.read_shared_secret().await? else {
            return Err(Error::not_ready(
                format!("secret {} not shared yet", ctx.shared_secret_name()),
                ctx.wait_requeue,
            ));
        };
        let name = api_manager.name_any();
        ctx.to_restore = Some(api_manager);
        ctx.save_status(|s| s.api_manager_to_restore_ref = Some(name)).await?;
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        Ok(ctx.status().api_manager_to_restore_ref.is_some())
    }
}

/// Creates the system file storage claim the restored files land in
pub struct SystemStoragePvc;

#[async_trait]
impl Step<RestoreContext> for SystemStoragePvc {
    fn identifier(&self) -> &str {
        "SystemStoragePvc"
    }

    async fn execute(&self, ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        if ctx.claims.get(&ctx.namespace, SYSTEM_STORAGE_PVC).await?.is_none() {
            ctx.claims
                .create(&ctx.namespace, &ctx.system_storage_claim())
                .await?;
            info!(claim = SYSTEM_STORAGE_PVC, "System storage claim created");
        }
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        if !ctx.restores_system_storage() {
            return Ok(true);
        }
        Ok(ctx.claims.get(&ctx.namespace, SYSTEM_STORAGE_PVC).await?.is_some())
    }
}

/// Recreates the APIManager from its backup
pub struct RestoreApiManager;

#[async_trait]
impl Step<RestoreContext> for RestoreApiManager {
    fn identifier(&self) -> &str {
        "RestoreApiManager"
    }

    async fn execute(&self, ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        let backed_up = ctx
            .to_restore
            .clone()
            .ok_or_else(|| Error::Sync("APIManager to restore not loaded".to_string()))?;

        let api_manager = APIManager {
            metadata: ObjectMeta {
                name: backed_up.metadata.name,
                namespace: Some(ctx.namespace.clone()),
                labels: backed_up.metadata.labels,
                annotations: backed_up.metadata.annotations,
                ..Default::default()
            },
            spec: backed_up.spec,
            status: None,
        };
        ctx.api_managers.create(&ctx.namespace, &api_manager).await?;
        info!(api_manager = %api_manager.name_any(), "APIManager restored");
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        match ctx.status().api_manager_to_restore_ref {
            Some(name) => Ok(ctx.api_managers.get(&ctx.namespace, &name).await?.is_some()),
            None => Ok(false),
        }
    }
}

pub struct WaitForApiManagerReady;

#[async_trait]
impl Step<RestoreContext> for WaitForApiManagerReady {
    fn identifier(&self) -> &str {
        "WaitForApiManagerReady"
    }

    async fn execute(&self, _ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        let Some(name) = ctx.status().api_manager_to_restore_ref else {
            return Ok(false);
        };
        Ok(ctx
            .api_managers
            .get(&ctx.namespace, &name)
            .await?
            .map(|a| a.deployments_ready())
            .unwrap_or(false))
    }
}

/// Removes the secret the serialized APIManager was shared through
pub struct SharedSecretCleanup;

#[async_trait]
impl Step<RestoreContext> for SharedSecretCleanup {
    fn identifier(&self) -> &str {
        "SharedSecretCleanup"
    }

    async fn execute(&self, ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        ctx.secrets
            .delete(&ctx.namespace, &ctx.shared_secret_name())
            .await?;
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        Ok(ctx
            .secrets
            .get(&ctx.namespace, &ctx.shared_secret_name())
            .await?
            .is_none())
    }
}

pub struct MainStepsCompleted;

#[async_trait]
impl Step<RestoreContext> for MainStepsCompleted {
    fn identifier(&self) -> &str {
        "MainStepsCompleted"
    }

    async fn execute(&self, ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        ctx.save_status(|s| s.main_steps_completed = Some(true)).await?;
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        Ok(ctx.status().main_steps_completed == Some(true))
    }
}

// ============================================================================
// Post steps
// ============================================================================

pub struct JobsCleanup;

impl JobsCleanup {
    fn job_names(ctx: &RestoreContext) -> Result<Vec<String>> {
        let uid = owner_uid(&ctx.restore)?;
        Ok(RESTORE_JOB_PREFIXES
            .iter()
            .map(|prefix| job_name(prefix, &uid))
            .collect())
    }
}

#[async_trait]
impl Step<RestoreContext> for JobsCleanup {
    fn identifier(&self) -> &str {
        "JobsCleanup"
    }

    async fn execute(&self, ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        for name in Self::job_names(ctx)? {
            ctx.jobs.delete(&ctx.namespace, &name).await?;
        }
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        for name in Self::job_names(ctx)? {
            if ctx.jobs.get(&ctx.namespace, &name).await?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub struct Completion;

#[async_trait]
impl Step<RestoreContext> for Completion {
    fn identifier(&self) -> &str {
        "Completion"
    }

    async fn execute(&self, ctx: &mut RestoreContext) -> Result<Option<Duration>> {
        let now = ctx.clock.now();
        ctx.save_status(|s| {
            s.completed = Some(true);
            s.completion_time = Some(now);
        })
        .await?;
        info!(restore = %ctx.restore.name_any(), "Restore completed");
        Ok(None)
    }

    async fn completed(&self, ctx: &RestoreContext) -> Result<bool> {
        Ok(ctx.status().completed == Some(true))
    }
}

pub fn main_pipeline(requeue_after: Duration) -> Result<Pipeline<RestoreContext>> {
    Ok(PipelineBuilder::new(requeue_after)
        .add_step(StartTime)?
        .add_step(JobStep::new("RestoreSecretsAndConfigMapsJob", restore_secrets_job))?
        .add_step(JobStep::new("ShareApiManagerJob", share_api_manager_job))?
        .add_step(ApiManagerRef)?
        .add_step(SystemStoragePvc)?
        .add_step(
            JobStep::new("RestoreSystemStorageJob", restore_system_storage_job)
                .when(RestoreContext::restores_system_storage),
        )?
        .add_step(RestoreApiManager)?
        .add_step(WaitForApiManagerReady)?
        .add_step(JobStep::new("ResyncZyncDomainsJob", resync_domains_job))?
        .add_step(SharedSecretCleanup)?
        .add_step(MainStepsCompleted)?
        .build())
}

pub fn post_pipeline(requeue_after: Duration) -> Result<Pipeline<RestoreContext>> {
    Ok(PipelineBuilder::new(requeue_after)
        .add_step(JobsCleanup)?
        .add_step(Completion)?
        .build())
}

/// One restore pass; `Some(delay)` asks to be called again
pub async fn reconcile(ctx: &mut RestoreContext, requeue_after: Duration) -> Result<Option<Duration>> {
    if ctx.status().completed == Some(true) {
        return Ok(None);
    }
    ctx.source_claim()?;

    if ctx.status().main_steps_completed != Some(true) {
        ctx.load().await?;
        if let Some(requeue) = main_pipeline(requeue_after)?.execute(ctx).await? {
            return Ok(Some(requeue));
        }
    }
    post_pipeline(requeue_after)?.execute(ctx).await
}
