//! Entities as returned by the admin API
//!
//! Every item carries the numeric ID assigned by the admin system. IDs are
//! only ever observed, never chosen by the operator.

use std::collections::BTreeMap;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Form parameters sent on create and update
pub type Params = BTreeMap<&'static str, String>;

/// Object owning methods, metrics and mapping rules
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Backend(i64),
    Product(i64),
}

impl Owner {
    pub fn id(&self) -> i64 {
        match self {
            Owner::Backend(id) | Owner::Product(id) => *id,
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::Backend(id) => write!(f, "backend {}", id),
            Owner::Product(id) => write!(f, "product {}", id),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendApiItem {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub private_endpoint: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProductItem {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub deployment_option: Option<String>,
    #[serde(default)]
    pub backend_version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MethodItem {
    pub id: i64,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub system_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MetricItem {
    pub id: i64,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub system_name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Set on methods, which the admin API models as child metrics
    #[serde(default)]
    pub parent_id: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MappingRuleItem {
    pub id: i64,
    #[serde(default)]
    pub http_method: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub metric_id: i64,
    #[serde(default)]
    pub delta: i64,
    #[serde(default)]
    pub last: bool,
}

impl MappingRuleItem {
    pub fn key(&self) -> String {
        format!("{}:{}", self.http_method.to_uppercase(), self.pattern)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PlanItem {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_name: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub trial_period_days: Option<i64>,
    #[serde(default)]
    pub setup_fee: Option<f64>,
    #[serde(default)]
    pub cost_per_month: Option<f64>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LimitItem {
    pub id: i64,
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub metric_id: i64,
}

/// Price of one unit of a metric within a usage range of a plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PricingRuleItem {
    pub id: i64,
    #[serde(default)]
    pub metric_id: i64,
    #[serde(default, deserialize_with = "amount")]
    pub cost_per_unit: f64,
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
}

/// Amounts arrive either as JSON numbers or as decimal strings
fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| de::Error::custom("amount out of range")),
        Value::String(s) => s.trim().parse().map_err(de::Error::custom),
        Value::Null => Ok(0.0),
        other => Err(de::Error::custom(format!("invalid amount: {}", other))),
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendUsageItem {
    pub id: i64,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "backend_id", default)]
    pub backend_id: i64,
    #[serde(default)]
    pub service_id: i64,
}
