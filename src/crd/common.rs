//! Types shared by the capability resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONDITION_SYNCED: &str = "Synced";
pub const CONDITION_INVALID: &str = "Invalid";
pub const CONDITION_ORPHAN: &str = "Orphan";
pub const CONDITION_FAILED: &str = "Failed";

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, value: bool, now: DateTime<Utc>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if value { "True" } else { "False" }.to_string(),
            last_transition_time: Some(now),
            reason: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Set of conditions keyed by type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(pub Vec<Condition>);

impl Conditions {
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true_for(&self, type_: &str) -> bool {
        self.get(type_).map(Condition::is_true).unwrap_or(false)
    }

    /// Replace the condition of the same type, or append it.
    ///
    /// The previous transition time is kept when the status does not change.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.0.push(condition),
        }
    }

    fn sorted(&self) -> Vec<&Condition> {
        let mut sorted: Vec<&Condition> = self.0.iter().collect();
        sorted.sort_by(|a, b| a.type_.cmp(&b.type_));
        sorted
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Order of conditions is not significant
impl PartialEq for Conditions {
    fn eq(&self, other: &Self) -> bool {
        self.sorted() == other.sorted()
    }
}

impl Eq for Conditions {}

/// Reference to a secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Status shared by every resource mirrored into the admin system
///
/// Unset fields serialize as `null` so a merge patch clears them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Identifier assigned by the admin system
    #[serde(default)]
    pub remote_id: Option<i64>,

    /// Remote state
    #[serde(default)]
    pub state: Option<String>,

    /// Admin system host the resource was synchronized with
    #[serde(default)]
    pub provider_account_host: Option<String>,

    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Error message of the last invalid spec
    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub conditions: Conditions,
}

/// Method of a backend or product
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MethodSpec {
    pub friendly_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Metric of a backend or product
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    pub friendly_name: String,

    pub unit: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Mapping rule of a backend or product
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MappingRuleSpec {
    #[serde(rename = "httpMethod")]
    pub http_method: String,

    pub pattern: String,

    /// System name of the metric or method incremented by the rule
    pub metric_method_ref: String,

    pub increment: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<bool>,
}

impl MappingRuleSpec {
    /// Unique key of a mapping rule within its owner
    pub fn key(&self) -> String {
        format!("{}:{}", self.http_method.to_uppercase(), self.pattern)
    }
}

pub const HITS_METRIC: &str = "hits";

/// Default `hits` metric present on every backend and product
pub fn hits_metric() -> MetricSpec {
    MetricSpec {
        friendly_name: "Hits".to_string(),
        unit: "hit".to_string(),
        description: "Number of API hits".to_string(),
    }
}

/// Derive a system name from a display name
pub fn system_name_from(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}
