//! Api and Binding Custom Resource Definitions
//!
//! An `Api` declares an API with its metrics, plans and mapping rules. A
//! `Binding` selects a set of `Api` resources by label and keeps them
//! synchronized with one admin account, recording the applied state in its
//! status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Api resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "capabilities.3scale.net",
    version = "v1alpha1",
    kind = "Api",
    plural = "apis",
    singular = "api",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub metrics: Vec<ApiMetricSpec>,

    #[serde(default)]
    pub plans: Vec<ApiPlanSpec>,

    #[serde(default)]
    pub mapping_rules: Vec<ApiMappingRuleSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiMetricSpec {
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiPlanSpec {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub trial_period: i64,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub limits: Vec<ApiLimitSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiLimitSpec {
    pub period: String,
    pub max_value: i64,
    /// Name of a metric of the same Api
    pub metric: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiMappingRuleSpec {
    pub method: String,
    pub path: String,
    #[serde(default = "default_increment")]
    pub increment: i64,
    /// Name of a metric of the same Api
    pub metric: String,
}

fn default_increment() -> i64 {
    1
}

/// Binding resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "capabilities.3scale.net",
    version = "v1alpha1",
    kind = "Binding",
    plural = "bindings",
    singular = "binding",
    namespaced,
    status = "BindingStatus",
    printcolumn = r#"{"name": "Last Sync", "type": "string", "jsonPath": ".status.lastSync"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    /// Secret holding `adminURL` and `token`
    pub credentials_ref: SecretReference,

    /// Labels selecting the Api resources managed by this binding
    #[serde(default, rename = "APISelector")]
    pub api_selector: LabelSelector,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Render as a list selector (`k=v,k2=v2`)
    pub fn to_selector_string(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Binding status
///
/// States are stored serialized so that the previously applied state
/// survives restarts.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,

    #[serde(default)]
    pub current_state: Option<String>,

    #[serde(default)]
    pub desired_state: Option<String>,

    #[serde(default)]
    pub previous_state: Option<String>,
}
