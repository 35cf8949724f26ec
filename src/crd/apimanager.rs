//! APIManager, APIManagerBackup and APIManagerRestore Custom Resource Definitions
//!
//! `APIManager` is owned by the platform installer; only the parts read by
//! the backup and restore pipelines are modelled here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// APIManager resource specification (opaque)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.3scale.net",
    version = "v1alpha1",
    kind = "APIManager",
    plural = "apimanagers",
    singular = "apimanager",
    namespaced,
    status = "APIManagerStatus"
)]
pub struct APIManagerSpec {
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct APIManagerStatus {
    #[serde(default)]
    pub deployments: DeploymentStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub ready: Vec<String>,
    #[serde(default)]
    pub starting: Vec<String>,
    #[serde(default)]
    pub stopped: Vec<String>,
}

impl APIManager {
    /// True once every deployment reports ready
    pub fn deployments_ready(&self) -> bool {
        match &self.status {
            Some(status) => {
                let d = &status.deployments;
                !d.ready.is_empty() && d.starting.is_empty() && d.stopped.is_empty()
            }
            None => false,
        }
    }
}

/// APIManagerBackup resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.3scale.net",
    version = "v1alpha1",
    kind = "APIManagerBackup",
    plural = "apimanagerbackups",
    singular = "apimanagerbackup",
    namespaced,
    status = "APIManagerBackupStatus",
    printcolumn = r#"{"name": "Completed", "type": "boolean", "jsonPath": ".status.completed"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerBackupSpec {
    pub backup_destination: BackupDestination,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupDestination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimDestination>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimDestination {
    /// Storage request (e.g. "10Gi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_requests: Option<String>,

    /// Bind to a pre-existing volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerBackupStatus {
    #[serde(default)]
    pub completed: Option<bool>,

    #[serde(default)]
    pub api_manager_source_name: Option<String>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub backup_persistent_volume_claim_name: Option<String>,
}

/// APIManagerRestore resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.3scale.net",
    version = "v1alpha1",
    kind = "APIManagerRestore",
    plural = "apimanagerrestores",
    singular = "apimanagerrestore",
    namespaced,
    status = "APIManagerRestoreStatus",
    printcolumn = r#"{"name": "Completed", "type": "boolean", "jsonPath": ".status.completed"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerRestoreSpec {
    pub restore_source: RestoreSource,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimSource>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSource {
    /// Name of the claim holding a previous backup
    pub claim_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerRestoreStatus {
    #[serde(default)]
    pub api_manager_to_restore_ref: Option<String>,

    #[serde(default)]
    pub completed: Option<bool>,

    #[serde(default)]
    pub main_steps_completed: Option<bool>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
}
