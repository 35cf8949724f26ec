//! Tests for the APIManager backup and restore pipelines

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde_json::json;

use threescale_operator::crd::{
    APIManager, APIManagerBackup, APIManagerBackupSpec, APIManagerRestore, APIManagerRestoreSpec,
    APIManagerSpec, APIManagerStatus, BackupDestination, DeploymentStatus,
    PersistentVolumeClaimDestination, PersistentVolumeClaimSource, RestoreSource,
};
use threescale_operator::error::{Error, SyncError};
use threescale_operator::reconcilers::backup::{self, BackupContext};
use threescale_operator::reconcilers::jobs::JobSettings;
use threescale_operator::reconcilers::restore::{self, RestoreContext};

use common::{FixedClock, MemoryStore, NAMESPACE};

const REQUEUE: Duration = Duration::from_secs(5);
const WAIT: Duration = Duration::from_secs(7);

// ============================================================================
// Test Helpers
// ============================================================================

fn settings() -> JobSettings {
    JobSettings {
        image: "quay.io/3scale/toolbox:latest".to_string(),
        service_account: "threescale-operator".to_string(),
    }
}

fn api_manager(name: &str, s3: bool) -> APIManager {
    let mut fields = BTreeMap::from([("wildcardDomain".to_string(), json!("apps.example.com"))]);
    if s3 {
        fields.insert(
            "system".to_string(),
            json!({"fileStorage": {"simpleStorageService": {"configurationSecretRef": {"name": "s3"}}}}),
        );
    }
    let mut api_manager = APIManager::new(name, APIManagerSpec { fields });
    api_manager.metadata.namespace = Some(NAMESPACE.to_string());
    api_manager
}

fn ready(api_manager: &mut APIManager) {
    api_manager.status = Some(APIManagerStatus {
        deployments: DeploymentStatus {
            ready: vec!["system-app".to_string(), "backend-listener".to_string()],
            starting: vec![],
            stopped: vec![],
        },
    });
}

fn succeed(jobs: &MemoryStore<Job>, name: &str) {
    jobs.modify(NAMESPACE, name, |job| {
        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        })
    });
}

fn fail(jobs: &MemoryStore<Job>, name: &str) {
    jobs.modify(NAMESPACE, name, |job| {
        job.status = Some(JobStatus {
            failed: Some(1),
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        })
    });
}

fn backup_resource(with_claim: bool) -> APIManagerBackup {
    let mut backup = APIManagerBackup::new(
        "nightly",
        APIManagerBackupSpec {
            backup_destination: BackupDestination {
                persistent_volume_claim: with_claim.then(|| PersistentVolumeClaimDestination {
                    storage_requests: Some("2Gi".to_string()),
                    ..Default::default()
                }),
            },
        },
    );
    backup.metadata.namespace = Some(NAMESPACE.to_string());
    backup.metadata.uid = Some("b-1".to_string());
    backup
}

struct BackupEnv {
    api_managers: Arc<MemoryStore<APIManager>>,
    backups: Arc<MemoryStore<APIManagerBackup>>,
    jobs: Arc<MemoryStore<Job>>,
    claims: Arc<MemoryStore<PersistentVolumeClaim>>,
}

impl BackupEnv {
    fn new(backup: APIManagerBackup) -> Self {
        let backups = Arc::new(MemoryStore::new());
        backups.insert(backup);
        Self {
            api_managers: Arc::new(MemoryStore::new()),
            backups,
            jobs: Arc::new(MemoryStore::new()),
            claims: Arc::new(MemoryStore::new()),
        }
    }

    async fn pass(&self) -> threescale_operator::Result<Option<Duration>> {
        let mut ctx = BackupContext {
            backup: self.backups.fetch(NAMESPACE, "nightly").unwrap(),
            namespace: NAMESPACE.to_string(),
            api_managers: self.api_managers.clone(),
            backups: self.backups.clone(),
            jobs: self.jobs.clone(),
            claims: self.claims.clone(),
            clock: Arc::new(FixedClock::at(1_700_000_000)),
            settings: settings(),
            source: None,
        };
        backup::reconcile(&mut ctx, REQUEUE).await
    }

    fn status(&self) -> threescale_operator::crd::APIManagerBackupStatus {
        self.backups
            .fetch(NAMESPACE, "nightly")
            .and_then(|b| b.status)
            .unwrap_or_default()
    }
}

fn restore_resource(claim: Option<&str>) -> APIManagerRestore {
    let mut restore = APIManagerRestore::new(
        "recover",
        APIManagerRestoreSpec {
            restore_source: RestoreSource {
                persistent_volume_claim: claim.map(|name| PersistentVolumeClaimSource {
                    claim_name: name.to_string(),
                }),
            },
        },
    );
    restore.metadata.namespace = Some(NAMESPACE.to_string());
    restore.metadata.uid = Some("r-1".to_string());
    restore
}

struct RestoreEnv {
    api_managers: Arc<MemoryStore<APIManager>>,
    restores: Arc<MemoryStore<APIManagerRestore>>,
    jobs: Arc<MemoryStore<Job>>,
    claims: Arc<MemoryStore<PersistentVolumeClaim>>,
    secrets: Arc<MemoryStore<Secret>>,
}

impl RestoreEnv {
    fn new(restore: APIManagerRestore) -> Self {
        let restores = Arc::new(MemoryStore::new());
        restores.insert(restore);
        Self {
            api_managers: Arc::new(MemoryStore::new()),
            restores,
            jobs: Arc::new(MemoryStore::new()),
            claims: Arc::new(MemoryStore::new()),
            secrets: Arc::new(MemoryStore::new()),
        }
    }

    async fn pass(&self) -> threescale_operator::Result<Option<Duration>> {
        let mut ctx = RestoreContext {
            restore: self.restores.fetch(NAMESPACE, "recover").unwrap(),
            namespace: NAMESPACE.to_string(),
            api_managers: self.api_managers.clone(),
            restores: self.restores.clone(),
            jobs: self.jobs.clone(),
            claims: self.claims.clone(),
            secrets: self.secrets.clone(),
            clock: Arc::new(FixedClock::at(1_700_000_000)),
            settings: settings(),
            wait_requeue: WAIT,
            to_restore: None,
        };
        restore::reconcile(&mut ctx, REQUEUE).await
    }

    fn status(&self) -> threescale_operator::crd::APIManagerRestoreStatus {
        self.restores
            .fetch(NAMESPACE, "recover")
            .and_then(|r| r.status)
            .unwrap_or_default()
    }

    /// What the share job would leave behind
    fn share(&self, api_manager: &APIManager) {
        self.secrets.insert(Secret {
            metadata: ObjectMeta {
                name: Some("recover-serialized-apimanager".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "apimanager-backup.json".to_string(),
                ByteString(serde_json::to_vec(api_manager).unwrap()),
            )])),
            ..Default::default()
        });
    }
}

// ============================================================================
// Backup
// ============================================================================

#[tokio::test]
async fn backup_runs_every_job_then_completes() {
    let env = BackupEnv::new(backup_resource(true));
    env.api_managers.insert(api_manager("apim", false));

    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    let status = env.status();
    assert_eq!(status.api_manager_source_name.as_deref(), Some("apim"));
    assert!(status.start_time.is_some());
    assert_eq!(status.backup_persistent_volume_claim_name.as_deref(), Some("nightly"));
    assert_eq!(env.jobs.names(), vec!["backup-cfgmaps-secrets-b-1"]);

    // Job still running
    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    assert_eq!(env.jobs.names().len(), 1);

    succeed(&env.jobs, "backup-cfgmaps-secrets-b-1");
    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    assert!(env.jobs.fetch(NAMESPACE, "backup-apimanager-cr-b-1").is_some());

    succeed(&env.jobs, "backup-apimanager-cr-b-1");
    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    assert!(env
        .jobs
        .fetch(NAMESPACE, "backup-system-filestorage-pvc-b-1")
        .is_some());

    succeed(&env.jobs, "backup-system-filestorage-pvc-b-1");
    assert_eq!(env.pass().await.unwrap(), None);
    let status = env.status();
    assert_eq!(status.completed, Some(true));
    assert!(status.completion_time.is_some());

    // Completed backups are left alone
    assert_eq!(env.pass().await.unwrap(), None);
}

#[tokio::test]
async fn backup_claim_carries_request_and_annotations() {
    let env = BackupEnv::new(backup_resource(true));
    env.api_managers.insert(api_manager("apim", false));
    env.pass().await.unwrap();

    let claim = env.claims.fetch(NAMESPACE, "nightly").expect("claim created");
    let annotations = claim.metadata.annotations.unwrap();
    assert_eq!(annotations["apiManagerName"], "apim");
    assert_eq!(annotations["apiManagerBackupUID"], "b-1");
    let requests = claim.spec.unwrap().resources.unwrap().requests.unwrap();
    assert_eq!(requests["storage"].0, "2Gi");
}

#[tokio::test]
async fn backup_jobs_are_owned_and_mount_the_claim() {
    let env = BackupEnv::new(backup_resource(true));
    env.api_managers.insert(api_manager("apim", false));
    env.pass().await.unwrap();

    let job = env.jobs.fetch(NAMESPACE, "backup-cfgmaps-secrets-b-1").unwrap();
    let owner = &job.metadata.owner_references.unwrap()[0];
    assert_eq!(owner.uid, "b-1");
    assert_eq!(owner.controller, Some(true));

    let pod = job.spec.unwrap().template.spec.unwrap();
    assert_eq!(pod.service_account_name.as_deref(), Some("threescale-operator"));
    let volumes = pod.volumes.unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(
        volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
        "nightly"
    );
}

#[tokio::test]
async fn s3_file_storage_skips_system_storage_job() {
    let env = BackupEnv::new(backup_resource(true));
    env.api_managers.insert(api_manager("apim", true));

    env.pass().await.unwrap();
    succeed(&env.jobs, "backup-cfgmaps-secrets-b-1");
    env.pass().await.unwrap();
    succeed(&env.jobs, "backup-apimanager-cr-b-1");

    assert_eq!(env.pass().await.unwrap(), None);
    assert_eq!(env.status().completed, Some(true));
    assert!(env
        .jobs
        .fetch(NAMESPACE, "backup-system-filestorage-pvc-b-1")
        .is_none());
}

#[tokio::test]
async fn backup_without_api_manager_is_an_orphan() {
    let env = BackupEnv::new(backup_resource(true));

    let err = env.pass().await.unwrap_err();

    assert!(matches!(err.classify(), SyncError::Orphan(_)));
    assert!(env.status().start_time.is_none());
}

#[tokio::test]
async fn backup_with_two_api_managers_is_invalid() {
    let env = BackupEnv::new(backup_resource(true));
    env.api_managers.insert(api_manager("apim", false));
    env.api_managers.insert(api_manager("apim-2", false));

    let err = env.pass().await.unwrap_err();
    assert!(matches!(err.classify(), SyncError::Invalid(m) if m.contains("found 2")));
}

#[tokio::test]
async fn backup_without_destination_is_invalid() {
    let env = BackupEnv::new(backup_resource(false));
    env.api_managers.insert(api_manager("apim", false));

    let err = env.pass().await.unwrap_err();
    assert!(matches!(err.classify(), SyncError::Invalid(_)));
    assert!(env.claims.names().is_empty());
}

#[tokio::test]
async fn failed_job_stops_the_backup() {
    let env = BackupEnv::new(backup_resource(true));
    env.api_managers.insert(api_manager("apim", false));
    env.pass().await.unwrap();

    fail(&env.jobs, "backup-cfgmaps-secrets-b-1");
    match env.pass().await {
        Err(Error::JobFailed(name)) => assert_eq!(name, "backup-cfgmaps-secrets-b-1"),
        other => panic!("expected job failure, got {:?}", other),
    }
    assert!(env.jobs.fetch(NAMESPACE, "backup-apimanager-cr-b-1").is_none());
}

// ============================================================================
// Restore
// ============================================================================

#[tokio::test]
async fn restore_walks_every_step_and_cleans_up() {
    let env = RestoreEnv::new(restore_resource(Some("nightly")));
    let backed_up = api_manager("apim", false);

    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    assert!(env.status().start_time.is_some());
    succeed(&env.jobs, "restore-cfgmaps-secrets-r-1");

    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    succeed(&env.jobs, "restore-apm-tosecret-r-1");

    // Shared secret not there yet
    match env.pass().await.unwrap_err().classify() {
        SyncError::Wait { message, retry_after } => {
            assert_eq!(retry_after, WAIT);
            assert!(message.contains("recover-serialized-apimanager"), "{}", message);
        }
        other => panic!("expected wait, got {:?}", other),
    }
    assert!(env.status().api_manager_to_restore_ref.is_none());

    env.share(&backed_up);
    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    assert_eq!(env.status().api_manager_to_restore_ref.as_deref(), Some("apim"));
    assert!(env.claims.fetch(NAMESPACE, "system-storage").is_some());
    succeed(&env.jobs, "restore-system-fs-r-1");

    // APIManager recreated, waiting for its deployments
    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    let restored = env.api_managers.fetch(NAMESPACE, "apim").expect("APIManager restored");
    assert_eq!(restored.spec.fields["wildcardDomain"], json!("apps.example.com"));
    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));

    env.api_managers.modify(NAMESPACE, "apim", ready);
    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    succeed(&env.jobs, "resync-domains-r-1");

    assert_eq!(env.pass().await.unwrap(), None);
    let status = env.status();
    assert_eq!(status.main_steps_completed, Some(true));
    assert_eq!(status.completed, Some(true));
    assert!(env.jobs.names().is_empty());
    assert!(env.secrets.names().is_empty());
}

#[tokio::test]
async fn s3_backed_restore_skips_file_storage() {
    let env = RestoreEnv::new(restore_resource(Some("nightly")));

    env.pass().await.unwrap();
    succeed(&env.jobs, "restore-cfgmaps-secrets-r-1");
    env.pass().await.unwrap();
    succeed(&env.jobs, "restore-apm-tosecret-r-1");
    env.share(&api_manager("apim", true));

    // Straight to waiting on the restored APIManager
    assert_eq!(env.pass().await.unwrap(), Some(REQUEUE));
    assert!(env.api_managers.fetch(NAMESPACE, "apim").is_some());
    assert!(env.claims.names().is_empty());
    assert!(env.jobs.fetch(NAMESPACE, "restore-system-fs-r-1").is_none());
}

#[tokio::test]
async fn restore_without_claim_is_invalid() {
    let env = RestoreEnv::new(restore_resource(None));

    let err = env.pass().await.unwrap_err();

    assert!(matches!(err.classify(), SyncError::Invalid(_)));
    assert!(env.jobs.names().is_empty());
    assert!(env.status().start_time.is_none());
}

#[tokio::test]
async fn completed_restore_is_not_repeated() {
    let mut resource = restore_resource(Some("nightly"));
    resource.status = Some(threescale_operator::crd::APIManagerRestoreStatus {
        completed: Some(true),
        ..Default::default()
    });
    let env = RestoreEnv::new(resource);

    assert_eq!(env.pass().await.unwrap(), None);
    assert!(env.jobs.names().is_empty());
}
