//! APIManagerBackup pipeline
//!
//! Copies the platform secrets and configmaps, the serialized APIManager and
//! the system file storage into a backup claim. All progress is recorded in
//! the backup status, so the pipeline can be rebuilt and resumed on every
//! reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use crate::clock::Clock;
use crate::cluster::ClusterStore;
use crate::crd::{APIManager, APIManagerBackup, APIManagerBackupStatus};
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineBuilder, Step};

use super::jobs::{
    job_name, owner_reference, owner_uid, ClaimMount, JobContext, JobSettings, JobStep, ScriptJob,
};

pub const BACKUP_MOUNT_PATH: &str = "/backup";
pub const SYSTEM_STORAGE_MOUNT_PATH: &str = "/system-filestorage-pvc";
pub const SYSTEM_STORAGE_PVC: &str = "system-storage";
pub const SERIALIZED_APIMANAGER_FILE: &str = "apimanager-backup.json";

/// Secrets copied into every backup
pub const BACKED_UP_SECRETS: [&str; 13] = [
    "backend-internal-api",
    "backend-listener",
    "backend-redis",
    "system-app",
    "system-database",
    "system-events-hook",
    "system-master-apicast",
    "system-memcache",
    "system-recaptcha",
    "system-redis",
    "system-seed",
    "system-smtp",
    "zync",
];

/// ConfigMaps copied into every backup
pub const BACKED_UP_CONFIGMAPS: [&str; 2] = ["apicast-environment", "system-environment"];

// Drops server-populated fields so the object can be created again elsewhere
const CLEANUP_SCRIPT: &str = r#"
import sys, json

parsed=json.load(sys.stdin)
if 'status' in parsed:
  del parsed['status']

metadataAttrsToDelete = ['ownerReferences', 'selfLink', 'uid', 'resourceVersion', 'creationTimestamp', 'namespace', 'clusterName', 'generation']
metadata=parsed['metadata']
for metadataAttr in metadataAttrsToDelete:
  if metadataAttr in metadata:
    del metadata[metadataAttr]

print(json.dumps(parsed, indent=4, sort_keys=True))
"#;

/// True when the APIManager keeps system files on a claim rather than in S3
pub fn uses_pvc_file_storage(api_manager: &APIManager) -> bool {
    api_manager
        .spec
        .fields
        .get("system")
        .and_then(|system| system.pointer("/fileStorage/simpleStorageService"))
        .is_none()
}

/// State of one backup pass
pub struct BackupContext {
    pub backup: APIManagerBackup,
    pub namespace: String,
    pub api_managers: Arc<dyn ClusterStore<APIManager>>,
    pub backups: Arc<dyn ClusterStore<APIManagerBackup>>,
    pub jobs: Arc<dyn ClusterStore<Job>>,
    pub claims: Arc<dyn ClusterStore<PersistentVolumeClaim>>,
    pub clock: Arc<dyn Clock>,
    pub settings: JobSettings,
    /// The APIManager being backed up, once known
    pub source: Option<APIManager>,
}

impl JobContext for BackupContext {
    fn jobs(&self) -> &dyn ClusterStore<Job> {
        self.jobs.as_ref()
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl BackupContext {
    pub fn status(&self) -> APIManagerBackupStatus {
        self.backup.status.clone().unwrap_or_default()
    }

    /// Fetch the source APIManager recorded in status, if any
    pub async fn load(&mut self) -> Result<()> {
        if let Some(name) = self.status().api_manager_source_name {
            self.source = self.api_managers.get(&self.namespace, &name).await?;
        }
        Ok(())
    }

    /// Apply `change` to the status and persist it
    pub async fn save_status(&mut self, change: impl FnOnce(&mut APIManagerBackupStatus)) -> Result<()> {
        let mut updated = self.backup.clone();
        let mut status = self.status();
        change(&mut status);
        updated.status = Some(status);
        self.backup = self.backups.update_status(&self.namespace, &updated).await?;
        Ok(())
    }

    fn source_name(&self) -> Result<String> {
        self.status()
            .api_manager_source_name
            .ok_or_else(|| Error::Sync("source APIManager not recorded".to_string()))
    }

    fn claim_name(&self) -> Result<String> {
        self.status()
            .backup_persistent_volume_claim_name
            .ok_or_else(|| Error::Sync("backup claim not recorded".to_string()))
    }

    fn backs_up_system_storage(&self) -> bool {
        self.source.as_ref().map(uses_pvc_file_storage).unwrap_or(false)
    }

    fn script_job(&self, prefix: &str, script: String, mounts: Vec<ClaimMount>) -> Result<Job> {
        Ok(ScriptJob {
            name: job_name(prefix, &owner_uid(&self.backup)?),
            namespace: &self.namespace,
            owner: owner_reference(&self.backup)?,
            container: prefix,
            script,
            mounts,
        }
        .build(&self.settings))
    }

    /// Claim receiving the backup
    pub fn destination_claim(&self) -> Result<PersistentVolumeClaim> {
        let destination = self
            .backup
            .spec
            .backup_destination
            .persistent_volume_claim
            .as_ref()
            .ok_or_else(|| Error::invalid("backupDestination.persistentVolumeClaim is required"))?;
        let source = self.source_name()?;

        let requests = destination
            .storage_requests
            .as_ref()
            .map(|r| BTreeMap::from([("storage".to_string(), Quantity(r.clone()))]));

        Ok(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.backup.name_any()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(BTreeMap::from([
                    ("apiManagerName".to_string(), source),
                    ("apiManagerBackupName".to_string(), self.backup.name_any()),
                    ("apiManagerBackupUID".to_string(), owner_uid(&self.backup)?),
                ])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: destination.storage_class.clone(),
                volume_name: destination.volume_name.clone(),
                resources: requests.map(|requests| VolumeResourceRequirements {
                    requests: Some(requests),
                    limits: None,
                }),
                ..Default::default()
            }),
            status: None,
        })
    }
}

fn secrets_and_configmaps_job(ctx: &BackupContext) -> Result<Job> {
    let script = format!(
        r#"
SECRETS="{secrets}";
CONFIGMAPS="{configmaps}";
BASEPATH="{base}";
PYTHON_CLEANUP_SUBSCRIPT="{cleanup}"
mkdir -p $BASEPATH/secrets;
mkdir -p $BASEPATH/configmaps;
for i in $(echo -n $SECRETS); do oc get secret -o json $i | python -c "${{PYTHON_CLEANUP_SUBSCRIPT}}" > $BASEPATH/secrets/$i.json; done;
for i in $(echo -n $CONFIGMAPS); do oc get configmap -o json $i | python -c "${{PYTHON_CLEANUP_SUBSCRIPT}}" > $BASEPATH/configmaps/$i.json; done;
"#,
        secrets = BACKED_UP_SECRETS.join(" "),
        configmaps = BACKED_UP_CONFIGMAPS.join(" "),
        base = BACKUP_MOUNT_PATH,
        cleanup = CLEANUP_SCRIPT,
    );
    ctx.script_job(
        "backup-cfgmaps-secrets",
        script,
        vec![ClaimMount::new(ctx.claim_name()?, BACKUP_MOUNT_PATH)],
    )
}

fn api_manager_job(ctx: &BackupContext) -> Result<Job> {
    let script = format!(
        r#"
BASEPATH="{base}";
PYTHON_CLEANUP_SUBSCRIPT="{cleanup}"
APIMANAGER_NAME="{name}"
APIMANAGER_BACKUP_FILENAME="{file}"
APIMANAGER_SUBDIR="$BASEPATH/apimanager";
mkdir -p ${{APIMANAGER_SUBDIR}};
oc get apimanager -o json ${{APIMANAGER_NAME}} | python -c "${{PYTHON_CLEANUP_SUBSCRIPT}}" > ${{APIMANAGER_SUBDIR}}/${{APIMANAGER_BACKUP_FILENAME}};
"#,
        base = BACKUP_MOUNT_PATH,
        cleanup = CLEANUP_SCRIPT,
        name = ctx.source_name()?,
        file = SERIALIZED_APIMANAGER_FILE,
    );
    ctx.script_job(
        "backup-apimanager-cr",
        script,
        vec![ClaimMount::new(ctx.claim_name()?, BACKUP_MOUNT_PATH)],
    )
}

fn system_storage_job(ctx: &BackupContext) -> Result<Job> {
    let script = format!(
        r#"
BASEPATH='{base}';
SYSTEM_FILESTORAGE_PVC_DIR='{storage}'
PVC_BACKUP_FILESTORAGE_SUBDIR="${{BASEPATH}}/system-filestorage-pvc";
mkdir -p ${{PVC_BACKUP_FILESTORAGE_SUBDIR}};
rsync -av ${{SYSTEM_FILESTORAGE_PVC_DIR}}/ ${{PVC_BACKUP_FILESTORAGE_SUBDIR}};
"#,
        base = BACKUP_MOUNT_PATH,
        storage = SYSTEM_STORAGE_MOUNT_PATH,
    );
    ctx.script_job(
        "backup-system-filestorage-pvc",
        script,
        vec![
            ClaimMount::new(ctx.claim_name()?, BACKUP_MOUNT_PATH),
            ClaimMount::new(SYSTEM_STORAGE_PVC, SYSTEM_STORAGE_MOUNT_PATH),
        ],
    )
}

// ============================================================================
// Steps
// ============================================================================

/// Records the single APIManager of the namespace as the backup source
pub struct SourceApiManager;

#[async_trait]
impl Step<BackupContext> for SourceApiManager {
    fn identifier(&self) -> &str {
        "SourceApiManager"
    }

    async fn execute(&self, ctx: &mut BackupContext) -> Result<Option<Duration>> {
        let mut found = ctx.api_managers.list(&ctx.namespace, None).await?;
        let source = match found.len() {
            0 => return Err(Error::orphan("no APIManager found in namespace")),
            1 => found.remove(0),
            n => {
                return Err(Error::invalid(format!(
                    "expected one APIManager in namespace, found {}",
                    n
                )))
            }
        };
        let name = source.name_any();
        ctx.source = Some(source);
        ctx.save_status(|s| s.api_manager_source_name = Some(name)).await?;
        Ok(None)
    }

    async fn completed(&self, ctx: &BackupContext) -> Result<bool> {
        Ok(ctx.status().api_manager_source_name.is_some())
    }
}

pub struct StartTime;

#[async_trait]
impl Step<BackupContext> for StartTime {
    fn identifier(&self) -> &str {
        "StartTime"
    }

    async fn execute(&self, ctx: &mut BackupContext) -> Result<Option<Duration>> {
        let now = ctx.clock.now();
        ctx.save_status(|s| s.start_time = Some(now)).await?;
        Ok(None)
    }

    async fn completed(&self, ctx: &BackupContext) -> Result<bool> {
        Ok(ctx.status().start_time.is_some())
    }
}

/// Creates the claim receiving the backup
pub struct DestinationPvc;

#[async_trait]
impl Step<BackupContext> for DestinationPvc {
    fn identifier(&self) -> &str {
        "DestinationPvc"
    }

    async fn execute(&self, ctx: &mut BackupContext) -> Result<Option<Duration>> {
        let claim = ctx.destination_claim()?;
        let name = claim.name_any();
        if ctx.claims.get(&ctx.namespace, &name).await?.is_none() {
            ctx.claims.create(&ctx.namespace, &claim).await?;
            info!(claim = %name, "Backup claim created");
        }
        ctx.save_status(|s| s.backup_persistent_volume_claim_name = Some(name))
            .await?;
        Ok(None)
    }

    async fn completed(&self, ctx: &BackupContext) -> Result<bool> {
        match ctx.status().backup_persistent_volume_claim_name {
            Some(name) => Ok(ctx.claims.get(&ctx.namespace, &name).await?.is_some()),
            None => Ok(false),
        }
    }
}

pub struct Completion;

#[async_trait]
impl Step<BackupContext> for Completion {
    fn identifier(&self) -> &str {
        "Completion"
    }

    async fn execute(&self, ctx: &mut BackupContext) -> Result<Option<Duration>> {
        let now = ctx.clock.now();
        ctx.save_status(|s| {
            s.completed = Some(true);
            s.completion_time = Some(now);
        })
        .await?;
        info!(backup = %ctx.backup.name_any(), "Backup completed");
        Ok(None)
    }

    async fn completed(&self, ctx: &BackupContext) -> Result<bool> {
        Ok(ctx.status().completed == Some(true))
    }
}

pub fn pipeline(requeue_after: Duration) -> Result<Pipeline<BackupContext>> {
    Ok(PipelineBuilder::new(requeue_after)
        .add_step(SourceApiManager)?
        .add_step(StartTime)?
        .add_step(DestinationPvc)?
        .add_step(JobStep::new("BackupSecretsAndConfigMapsJob", secrets_and_configmaps_job))?
        .add_step(JobStep::new("BackupApiManagerJob", api_manager_job))?
        .add_step(
            JobStep::new("BackupSystemStorageJob", system_storage_job)
                .when(BackupContext::backs_up_system_storage),
        )?
        .add_step(Completion)?
        .build())
}

/// One backup pass; `Some(delay)` asks to be called again
pub async fn reconcile(ctx: &mut BackupContext, requeue_after: Duration) -> Result<Option<Duration>> {
    if ctx.status().completed == Some(true) {
        return Ok(None);
    }
    ctx.load().await?;
    pipeline(requeue_after)?.execute(ctx).await
}
