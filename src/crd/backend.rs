//! Backend Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{LocalObjectReference, MappingRuleSpec, MethodSpec, MetricSpec, SyncStatus};

/// Backend resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "capabilities.3scale.net",
    version = "v1beta1",
    kind = "Backend",
    plural = "backends",
    singular = "backend",
    namespaced,
    status = "SyncStatus",
    printcolumn = r#"{"name": "Remote ID", "type": "integer", "jsonPath": ".status.remoteId"}"#,
    printcolumn = r#"{"name": "Synced", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Synced\")].status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    /// Display name
    pub name: String,

    /// System name, derived from the name when empty
    #[serde(default)]
    pub system_name: String,

    /// Private endpoint of the API
    #[serde(rename = "privateBaseURL")]
    pub private_base_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub mapping_rules: Vec<MappingRuleSpec>,

    /// Metrics keyed by system name
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSpec>,

    /// Methods keyed by system name
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSpec>,

    /// Secret holding the admin system credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_account_ref: Option<LocalObjectReference>,
}
