//! Product Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{LocalObjectReference, MappingRuleSpec, MethodSpec, MetricSpec, SyncStatus};

/// Product resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "capabilities.3scale.net",
    version = "v1beta1",
    kind = "Product",
    plural = "products",
    singular = "product",
    namespaced,
    status = "SyncStatus",
    printcolumn = r#"{"name": "Remote ID", "type": "integer", "jsonPath": ".status.remoteId"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Synced", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Synced\")].status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProductSpec {
    /// Display name
    pub name: String,

    /// System name, derived from the name when empty
    #[serde(default)]
    pub system_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Gateway deployment option
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<ProductDeploymentSpec>,

    #[serde(default)]
    pub mapping_rules: Vec<MappingRuleSpec>,

    /// Backends used by the product, keyed by backend system name
    #[serde(default)]
    pub backend_usages: BTreeMap<String, BackendUsageSpec>,

    /// Metrics keyed by system name
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSpec>,

    /// Methods keyed by system name
    #[serde(default)]
    pub methods: BTreeMap<String, MethodSpec>,

    /// Application plans keyed by system name
    #[serde(default)]
    pub application_plans: BTreeMap<String, ApplicationPlanSpec>,

    /// Secret holding the admin system credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_account_ref: Option<LocalObjectReference>,
}

impl ProductSpec {
    /// Deployment option understood by the admin API
    pub fn deployment_option(&self) -> Option<&'static str> {
        let deployment = self.deployment.as_ref()?;
        if deployment.apicast_hosted.is_some() {
            Some("hosted")
        } else if deployment.apicast_self_managed.is_some() {
            Some("self_managed")
        } else {
            None
        }
    }

    /// Authentication mode understood by the admin API ("1" user key, "2" app id)
    pub fn backend_version(&self) -> Option<&'static str> {
        let deployment = self.deployment.as_ref()?;
        let authentication = deployment
            .apicast_hosted
            .as_ref()
            .and_then(|d| d.authentication.as_ref())
            .or_else(|| {
                deployment
                    .apicast_self_managed
                    .as_ref()
                    .and_then(|d| d.authentication.as_ref())
            })?;

        if authentication.userkey.is_some() {
            Some("1")
        } else if authentication.app_key_app_id.is_some() {
            Some("2")
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProductDeploymentSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apicast_hosted: Option<ApicastDeploymentSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub apicast_self_managed: Option<ApicastDeploymentSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApicastDeploymentSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationSpec>,

    #[serde(rename = "stagingPublicBaseURL", skip_serializing_if = "Option::is_none")]
    pub staging_public_base_url: Option<String>,

    #[serde(rename = "productionPublicBaseURL", skip_serializing_if = "Option::is_none")]
    pub production_public_base_url: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userkey: Option<CredentialsSpec>,

    #[serde(rename = "appKeyAppID", skip_serializing_if = "Option::is_none")]
    pub app_key_app_id: Option<CredentialsSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsSpec {
    /// Where credentials are read from (headers, query, authorization)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

/// Reference to a metric or method, optionally scoped to a backend
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricMethodRefSpec {
    pub system_name: String,

    /// Backend system name when the metric belongs to a backend
    #[serde(rename = "backend", skip_serializing_if = "Option::is_none")]
    pub backend_system_name: Option<String>,
}

impl std::fmt::Display for MetricMethodRefSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backend_system_name {
            Some(backend) => write!(f, "{}.{}", backend, self.system_name),
            None => write!(f, "{}", self.system_name),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LimitSpec {
    /// eternity, year, month, week, day, hour or minute
    pub period: String,

    pub value: i64,

    pub metric_method_ref: MetricMethodRefSpec,
}

/// Cost per unit of a metric over a usage range; rules on one metric must not overlap
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PricingRuleSpec {
    pub from: i64,

    pub to: i64,

    pub metric_method_ref: MetricMethodRefSpec,

    /// Decimal amount, e.g. "0.05"
    pub price_per_unit: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPlanSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps_require_approval: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_period: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_fee: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_month: Option<String>,

    /// Marks the plan as the product default
    #[serde(default)]
    pub default: bool,

    #[serde(default)]
    pub limits: Vec<LimitSpec>,

    #[serde(default)]
    pub pricing_rules: Vec<PricingRuleSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct BackendUsageSpec {
    pub path: String,
}
