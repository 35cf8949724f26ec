//! Binding state snapshots
//!
//! A binding manages the APIs its selector matches. Each pass compares three
//! snapshots keyed by API name: desired (from `Api` resources), current (read
//! from the admin system) and previous (what the binding last applied, kept in
//! its status). An API is only ever deleted remotely when this binding
//! applied it before.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapters::provider_account;
use crate::clock::Clock;
use crate::cluster::ClusterStore;
use crate::crd::common::{hits_metric, HITS_METRIC};
use crate::crd::{
    Api, ApplicationPlanSpec, Binding, BindingStatus, LimitSpec, LocalObjectReference,
    MappingRuleSpec, MetricMethodRefSpec, MetricSpec, ProductSpec,
};
use crate::error::{Error, Result};
use crate::remote::{Owner, ProviderAccount, RemoteAdminGateway};

use super::entities::MetricIndex;
use super::product;
use super::validation::{HTTP_METHODS, LIMIT_PERIODS};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalMetric {
    pub friendly_name: String,
    pub unit: String,
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalLimit {
    pub period: String,
    pub max_value: i64,
    pub metric: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalPlan {
    pub name: String,
    pub default: bool,
    pub trial_period: i64,
    pub approval_required: bool,
    /// Keyed by `metric:period`
    pub limits: BTreeMap<String, InternalLimit>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalMappingRule {
    pub method: String,
    pub path: String,
    pub increment: i64,
    pub metric: String,
}

/// One API as both sides of the comparison see it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalApi {
    pub description: String,
    pub metrics: BTreeMap<String, InternalMetric>,
    pub plans: BTreeMap<String, InternalPlan>,
    /// Keyed by `METHOD:path`
    pub mapping_rules: BTreeMap<String, InternalMappingRule>,
}

/// APIs keyed by name
pub type State = BTreeMap<String, InternalApi>;

fn limit_key(metric: &str, period: &str) -> String {
    format!("{}:{}", metric, period)
}

impl InternalApi {
    /// Desired form of an `Api` resource; references are checked against its metrics
    pub fn from_resource(api: &Api) -> Result<Self> {
        let name = api.name_any();
        let mut metrics = BTreeMap::from([(HITS_METRIC.to_string(), hits_internal())]);
        for metric in &api.spec.metrics {
            metrics.insert(
                metric.name.clone(),
                InternalMetric {
                    friendly_name: metric.name.clone(),
                    unit: metric.unit.clone(),
                    description: metric.description.clone(),
                },
            );
        }

        let unknown = |metric: &str| {
            Error::invalid(format!("api {}: unknown metric '{}'", name, metric))
        };

        let mut mapping_rules = BTreeMap::new();
        for rule in &api.spec.mapping_rules {
            let method = rule.method.to_uppercase();
            if !HTTP_METHODS.contains(&method.as_str()) {
                return Err(Error::invalid(format!(
                    "api {}: '{}' is not an HTTP method",
                    name, rule.method
                )));
            }
            if !metrics.contains_key(&rule.metric) {
                return Err(unknown(&rule.metric));
            }
            mapping_rules.insert(
                format!("{}:{}", method, rule.path),
                InternalMappingRule {
                    method,
                    path: rule.path.clone(),
                    increment: rule.increment,
                    metric: rule.metric.clone(),
                },
            );
        }

        let mut plans = BTreeMap::new();
        for plan in &api.spec.plans {
            let mut limits = BTreeMap::new();
            for limit in &plan.limits {
                if !metrics.contains_key(&limit.metric) {
                    return Err(unknown(&limit.metric));
                }
                if !LIMIT_PERIODS.contains(&limit.period.as_str()) {
                    return Err(Error::invalid(format!(
                        "api {}: limit period '{}' is not supported",
                        name, limit.period
                    )));
                }
                limits.insert(
                    limit_key(&limit.metric, &limit.period),
                    InternalLimit {
                        period: limit.period.clone(),
                        max_value: limit.max_value,
                        metric: limit.metric.clone(),
                    },
                );
            }
            plans.insert(
                plan.name.clone(),
                InternalPlan {
                    name: plan.name.clone(),
                    default: plan.default,
                    trial_period: plan.trial_period,
                    approval_required: plan.approval_required,
                    limits,
                },
            );
        }

        let defaults: Vec<&str> = api
            .spec
            .plans
            .iter()
            .filter(|p| p.default)
            .map(|p| p.name.as_str())
            .collect();
        if defaults.len() > 1 {
            return Err(Error::invalid(format!(
                "api {}: only one plan can be the default, found {}",
                name,
                defaults.join(", ")
            )));
        }

        Ok(Self {
            description: api.spec.description.clone(),
            metrics,
            plans,
            mapping_rules,
        })
    }

    /// Product spec converging the admin system onto this API
    pub fn to_product_spec(&self, name: &str) -> ProductSpec {
        ProductSpec {
            name: name.to_string(),
            system_name: name.to_string(),
            description: self.description.clone(),
            deployment: None,
            mapping_rules: self
                .mapping_rules
                .values()
                .map(|r| MappingRuleSpec {
                    http_method: r.method.clone(),
                    pattern: r.path.clone(),
                    metric_method_ref: r.metric.clone(),
                    increment: r.increment,
                    last: None,
                })
                .collect(),
            backend_usages: BTreeMap::new(),
            metrics: self
                .metrics
                .iter()
                .map(|(key, m)| {
                    (
                        key.clone(),
                        MetricSpec {
                            friendly_name: m.friendly_name.clone(),
                            unit: m.unit.clone(),
                            description: m.description.clone(),
                        },
                    )
                })
                .collect(),
            methods: BTreeMap::new(),
            application_plans: self
                .plans
                .iter()
                .map(|(key, p)| {
                    (
                        key.clone(),
                        ApplicationPlanSpec {
                            name: Some(p.name.clone()),
                            apps_require_approval: Some(p.approval_required),
                            trial_period: Some(p.trial_period),
                            setup_fee: None,
                            cost_month: None,
                            default: p.default,
                            limits: p
                                .limits
                                .values()
                                .map(|l| LimitSpec {
                                    period: l.period.clone(),
                                    value: l.max_value,
                                    metric_method_ref: MetricMethodRefSpec {
                                        system_name: l.metric.clone(),
                                        backend_system_name: None,
                                    },
                                })
                                .collect(),
                            pricing_rules: Vec::new(),
                        },
                    )
                })
                .collect(),
            provider_account_ref: None,
        }
    }
}

fn hits_internal() -> InternalMetric {
    let hits = hits_metric();
    InternalMetric {
        friendly_name: hits.friendly_name,
        unit: hits.unit,
        description: hits.description,
    }
}

/// Desired snapshot from the selected `Api` resources
pub fn desired_state(apis: &[Api]) -> Result<State> {
    apis.iter()
        .map(|api| Ok((api.name_any(), InternalApi::from_resource(api)?)))
        .collect()
}

/// Read one API from the admin system; `None` when it does not exist there
pub async fn read_api(gateway: &dyn RemoteAdminGateway, name: &str) -> Result<Option<InternalApi>> {
    let Some(found) = product::find_product(gateway, name).await? else {
        return Ok(None);
    };
    let owner = Owner::Product(found.id);
    let index = MetricIndex::load(gateway, owner).await?;
    let metric_name = |id: i64| index.system_name(id).unwrap_or_default().to_string();

    let metrics = gateway
        .list_metrics(owner)
        .await?
        .into_iter()
        .map(|m| {
            (
                m.system_name,
                InternalMetric {
                    friendly_name: m.friendly_name,
                    unit: m.unit,
                    description: m.description.unwrap_or_default(),
                },
            )
        })
        .collect();

    let mapping_rules = gateway
        .list_mapping_rules(owner)
        .await?
        .into_iter()
        .map(|r| {
            (
                r.key(),
                InternalMappingRule {
                    method: r.http_method.to_uppercase(),
                    path: r.pattern.clone(),
                    increment: r.delta,
                    metric: metric_name(r.metric_id),
                },
            )
        })
        .collect();

    let mut plans = BTreeMap::new();
    for plan in gateway.list_plans(found.id).await? {
        let limits = gateway
            .list_limits(plan.id)
            .await?
            .into_iter()
            .map(|l| {
                let metric = metric_name(l.metric_id);
                (
                    limit_key(&metric, &l.period),
                    InternalLimit {
                        period: l.period,
                        max_value: l.value,
                        metric,
                    },
                )
            })
            .collect();
        plans.insert(
            plan.system_name.clone(),
            InternalPlan {
                name: plan.name,
                default: plan.default,
                trial_period: plan.trial_period_days.unwrap_or(0),
                approval_required: plan.approval_required,
                limits,
            },
        );
    }

    Ok(Some(InternalApi {
        description: found.description.unwrap_or_default(),
        metrics,
        plans,
        mapping_rules,
    }))
}

/// Current snapshot of the named APIs; APIs missing remotely are left out
pub async fn current_state<'a>(
    gateway: &dyn RemoteAdminGateway,
    names: impl IntoIterator<Item = &'a String>,
) -> Result<State> {
    let mut state = State::new();
    for name in names {
        match read_api(gateway, name).await {
            Ok(Some(api)) => {
                state.insert(name.clone(), api);
            }
            Ok(None) => debug!(api = %name, "Api not present remotely"),
            Err(e) if e.is_remote_not_found() => debug!(api = %name, "Api removed while reading"),
            Err(e) => return Err(e),
        }
    }
    Ok(state)
}

/// Changes one pass applies
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub create: Vec<String>,
    pub update: Vec<String>,
    pub delete: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Compare the three snapshots
///
/// Deletion requires an API to be absent from desired, present in previous
/// and present remotely.
pub fn plan(desired: &State, current: &State, previous: &State) -> Plan {
    let mut plan = Plan::default();
    if desired == current {
        return plan;
    }
    for (name, api) in desired {
        match current.get(name) {
            None => plan.create.push(name.clone()),
            Some(existing) if existing != api => plan.update.push(name.clone()),
            Some(_) => {}
        }
    }
    plan.delete = previous
        .keys()
        .filter(|name| !desired.contains_key(*name) && current.contains_key(*name))
        .cloned()
        .collect();
    plan
}

pub fn parse_state(serialized: Option<&str>) -> Result<State> {
    match serialized {
        Some(s) if !s.is_empty() => Ok(serde_json::from_str(s)?),
        _ => Ok(State::new()),
    }
}

fn serialize_state(state: &State) -> Result<String> {
    Ok(serde_json::to_string(state)?)
}

/// State of one binding pass
pub struct BindingContext {
    pub binding: Binding,
    pub namespace: String,
    pub apis: Arc<dyn ClusterStore<Api>>,
    pub bindings: Arc<dyn ClusterStore<Binding>>,
    pub gateway: Arc<dyn RemoteAdminGateway>,
    pub clock: Arc<dyn Clock>,
}

/// Result of one binding pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingOutcome {
    pub applied: Plan,
    pub status_written: bool,
}

/// Credentials named by the binding; the secret defaults to the binding's namespace
pub async fn binding_account(
    binding: &Binding,
    secrets: &dyn ClusterStore<Secret>,
) -> Result<ProviderAccount> {
    let reference = &binding.spec.credentials_ref;
    let namespace = reference
        .namespace
        .clone()
        .or_else(|| binding.namespace())
        .unwrap_or_default();
    let local = LocalObjectReference {
        name: reference.name.clone(),
    };
    provider_account(secrets, &namespace, Some(&local), &reference.name).await
}

fn next_status(
    persisted: &BindingStatus,
    desired: &State,
    current: &State,
    last_sync: Option<DateTime<Utc>>,
) -> Result<BindingStatus> {
    Ok(BindingStatus {
        last_sync: last_sync.or(persisted.last_sync),
        current_state: Some(serialize_state(current)?),
        desired_state: Some(serialize_state(desired)?),
        previous_state: Some(serialize_state(desired)?),
    })
}

pub async fn reconcile(ctx: &mut BindingContext) -> Result<BindingOutcome> {
    let selector = ctx.binding.spec.api_selector.to_selector_string();
    let apis = ctx.apis.list(&ctx.namespace, Some(&selector)).await?;
    let desired = desired_state(&apis)?;

    let persisted = ctx.binding.status.clone().unwrap_or_default();
    let previous = parse_state(persisted.previous_state.as_deref())?;

    let names: BTreeSet<&String> = desired.keys().chain(previous.keys()).collect();
    let current = current_state(ctx.gateway.as_ref(), names).await?;

    let changes = plan(&desired, &current, &previous);
    let gateway = ctx.gateway.as_ref();

    for name in changes.create.iter().chain(changes.update.iter()) {
        let spec = desired[name].to_product_spec(name);
        let (_, result) = product::sync(ctx.gateway.clone(), &spec).await;
        result.map_err(|e| e.in_task(format!("api {}", name)))?;
        info!(api = %name, "Api synchronized");
    }
    for name in &changes.delete {
        let spec = previous[name].to_product_spec(name);
        product::delete(gateway, &spec, None).await?;
        info!(api = %name, "Api deleted");
    }

    let status = if changes.is_empty() {
        next_status(&persisted, &desired, &current, None)?
    } else {
        next_status(&persisted, &desired, &desired, Some(ctx.clock.now()))?
    };

    let mut outcome = BindingOutcome {
        applied: changes,
        status_written: false,
    };
    if status != persisted {
        let mut updated = ctx.binding.clone();
        updated.status = Some(status);
        ctx.binding = ctx.bindings.update_status(&ctx.namespace, &updated).await?;
        outcome.status_written = true;
    }
    Ok(outcome)
}
