//! Entity-set synchronization shared by backends and products
//!
//! Each `sync_*` function lists the remote set, diffs it against the desired
//! set and applies the result in the order delete, update, create. The first
//! failing call aborts the rest of that kind; nothing is rolled back.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::crd::{
    ApplicationPlanSpec, BackendUsageSpec, MappingRuleSpec, MethodSpec, MetricMethodRefSpec, MetricSpec,
};
use crate::diff::{diff, track, TrackedEntity};
use crate::error::{Error, Result};
use crate::remote::{
    BackendUsageItem, LimitItem, MappingRuleItem, MethodItem, MetricItem, Owner, Params, PlanItem,
    PricingRuleItem, RemoteAdminGateway,
};

/// Counts of applied changes for one entity kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl Applied {
    fn log(self, kind: &str, owner: impl std::fmt::Display) -> Self {
        if self == Applied::default() {
            debug!(kind, owner = %owner, "Entities in sync");
        } else {
            info!(
                kind,
                owner = %owner,
                created = self.created,
                updated = self.updated,
                deleted = self.deleted,
                "Entities synchronized"
            );
        }
        self
    }
}

fn description_of(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

// ============================================================================
// Methods and metrics
// ============================================================================

impl TrackedEntity<MethodItem> for MethodSpec {
    fn create_params(&self, key: &str) -> Params {
        let mut params = Params::from([
            ("system_name", key.to_string()),
            ("friendly_name", self.friendly_name.clone()),
        ]);
        if !self.description.is_empty() {
            params.insert("description", self.description.clone());
        }
        params
    }

    fn changed_params(&self, existing: &MethodItem) -> Params {
        let mut params = Params::new();
        track(&mut params, "friendly_name", &self.friendly_name, &existing.friendly_name);
        track(&mut params, "description", &self.description, &description_of(&existing.description));
        params
    }
}

impl TrackedEntity<MetricItem> for MetricSpec {
    fn create_params(&self, key: &str) -> Params {
        let mut params = Params::from([
            ("system_name", key.to_string()),
            ("friendly_name", self.friendly_name.clone()),
            ("unit", self.unit.clone()),
        ]);
        if !self.description.is_empty() {
            params.insert("description", self.description.clone());
        }
        params
    }

    fn changed_params(&self, existing: &MetricItem) -> Params {
        let mut params = Params::new();
        track(&mut params, "friendly_name", &self.friendly_name, &existing.friendly_name);
        track(&mut params, "unit", &self.unit, &existing.unit);
        track(&mut params, "description", &self.description, &description_of(&existing.description));
        params
    }
}

pub async fn sync_methods(
    gateway: &dyn RemoteAdminGateway,
    owner: Owner,
    desired: &BTreeMap<String, MethodSpec>,
) -> Result<Applied> {
    let existing = gateway
        .list_methods(owner)
        .await?
        .into_iter()
        .map(|m| (m.system_name.clone(), m))
        .collect();

    let result = diff(desired.clone(), existing);
    let mut applied = Applied::default();

    for (_, method) in result.to_delete {
        gateway.delete_method(owner, method.id).await?;
        applied.deleted += 1;
    }
    for update in result.to_update {
        gateway.update_method(owner, update.existing.id, &update.changes).await?;
        applied.updated += 1;
    }
    for (key, method) in result.to_create {
        gateway.create_method(owner, &method.create_params(&key)).await?;
        applied.created += 1;
    }

    Ok(applied.log("method", owner))
}

/// Sync top-level metrics. Deleting a metric also removes its mapping rules remotely.
pub async fn sync_metrics(
    gateway: &dyn RemoteAdminGateway,
    owner: Owner,
    desired: &BTreeMap<String, MetricSpec>,
) -> Result<Applied> {
    let existing = gateway
        .list_metrics(owner)
        .await?
        .into_iter()
        .map(|m| (m.system_name.clone(), m))
        .collect();

    let result = diff(desired.clone(), existing);
    let mut applied = Applied::default();

    for (_, metric) in result.to_delete {
        gateway.delete_metric(owner, metric.id).await?;
        applied.deleted += 1;
    }
    for update in result.to_update {
        gateway.update_metric(owner, update.existing.id, &update.changes).await?;
        applied.updated += 1;
    }
    for (key, metric) in result.to_create {
        gateway.create_metric(owner, &metric.create_params(&key)).await?;
        applied.created += 1;
    }

    Ok(applied.log("metric", owner))
}

/// Remote IDs of the metrics and methods of one owner, by system name
#[derive(Clone, Debug, Default)]
pub struct MetricIndex {
    ids: BTreeMap<String, i64>,
}

impl MetricIndex {
    pub async fn load(gateway: &dyn RemoteAdminGateway, owner: Owner) -> Result<Self> {
        let mut ids: BTreeMap<String, i64> = gateway
            .list_metrics(owner)
            .await?
            .into_iter()
            .map(|m| (m.system_name, m.id))
            .collect();
        ids.extend(
            gateway
                .list_methods(owner)
                .await?
                .into_iter()
                .map(|m| (m.system_name, m.id)),
        );
        Ok(Self { ids })
    }

    pub fn id(&self, system_name: &str) -> Option<i64> {
        self.ids.get(system_name).copied()
    }

    /// Reverse lookup
    pub fn system_name(&self, id: i64) -> Option<&str> {
        self.ids
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }
}

// ============================================================================
// Mapping rules
// ============================================================================

/// Mapping rule with its metric reference resolved to a remote ID
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredMappingRule {
    pub http_method: String,
    pub pattern: String,
    pub metric_id: i64,
    pub delta: i64,
    pub last: bool,
}

impl TrackedEntity<MappingRuleItem> for DesiredMappingRule {
    fn create_params(&self, _key: &str) -> Params {
        Params::from([
            ("http_method", self.http_method.clone()),
            ("pattern", self.pattern.clone()),
            ("metric_id", self.metric_id.to_string()),
            ("delta", self.delta.to_string()),
            ("last", self.last.to_string()),
        ])
    }

    fn changed_params(&self, existing: &MappingRuleItem) -> Params {
        let mut params = Params::new();
        track(&mut params, "metric_id", &self.metric_id, &existing.metric_id);
        track(&mut params, "delta", &self.delta, &existing.delta);
        track(&mut params, "last", &self.last, &existing.last);
        params
    }
}

/// Sync mapping rules, keyed by `METHOD:pattern`
///
/// `declared` holds the metric and method system names of the same spec; a
/// rule referencing anything else is invalid.
pub async fn sync_mapping_rules(
    gateway: &dyn RemoteAdminGateway,
    owner: Owner,
    rules: &[MappingRuleSpec],
    declared: &BTreeSet<String>,
) -> Result<Applied> {
    let index = MetricIndex::load(gateway, owner).await?;

    let mut desired = BTreeMap::new();
    for rule in rules {
        if !declared.contains(&rule.metric_method_ref) {
            return Err(Error::invalid(format!(
                "mapping rule {} references unknown metric or method '{}'",
                rule.key(),
                rule.metric_method_ref
            )));
        }
        let metric_id = index.id(&rule.metric_method_ref).ok_or_else(|| {
            Error::Sync(format!(
                "metric or method '{}' of {} missing remotely",
                rule.metric_method_ref, owner
            ))
        })?;
        desired.insert(
            rule.key(),
            DesiredMappingRule {
                http_method: rule.http_method.to_uppercase(),
                pattern: rule.pattern.clone(),
                metric_id,
                delta: rule.increment,
                last: rule.last.unwrap_or(false),
            },
        );
    }

    let existing = gateway
        .list_mapping_rules(owner)
        .await?
        .into_iter()
        .map(|r| (r.key(), r))
        .collect();

    let result = diff(desired, existing);
    let mut applied = Applied::default();

    for (_, rule) in result.to_delete {
        gateway.delete_mapping_rule(owner, rule.id).await?;
        applied.deleted += 1;
    }
    for update in result.to_update {
        gateway
            .update_mapping_rule(owner, update.existing.id, &update.changes)
            .await?;
        applied.updated += 1;
    }
    for (key, rule) in result.to_create {
        gateway
            .create_mapping_rule(owner, &rule.create_params(&key))
            .await?;
        applied.created += 1;
    }

    Ok(applied.log("mapping rule", owner))
}

// ============================================================================
// Application plans and limits
// ============================================================================

fn fee(value: &Option<String>) -> Result<Option<f64>> {
    value
        .as_deref()
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| Error::invalid(format!("'{}' is not a valid amount", v)))
        })
        .transpose()
}

fn track_fee(params: &mut Params, name: &'static str, desired: Option<f64>, current: Option<f64>) {
    if let Some(desired) = desired {
        if (desired - current.unwrap_or(0.0)).abs() > f64::EPSILON {
            params.insert(name, desired.to_string());
        }
    }
}

/// Application plan with its amounts parsed
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredPlan {
    pub name: Option<String>,
    pub approval_required: Option<bool>,
    pub trial_period_days: Option<i64>,
    pub setup_fee: Option<f64>,
    pub cost_per_month: Option<f64>,
}

impl DesiredPlan {
    pub fn from_spec(spec: &ApplicationPlanSpec) -> Result<Self> {
        Ok(Self {
            name: spec.name.clone(),
            approval_required: spec.apps_require_approval,
            trial_period_days: spec.trial_period,
            setup_fee: fee(&spec.setup_fee)?,
            cost_per_month: fee(&spec.cost_month)?,
        })
    }
}

impl TrackedEntity<PlanItem> for DesiredPlan {
    fn create_params(&self, key: &str) -> Params {
        let mut params = Params::from([
            ("system_name", key.to_string()),
            ("name", self.name.clone().unwrap_or_else(|| key.to_string())),
        ]);
        if let Some(approval) = self.approval_required {
            params.insert("approval_required", approval.to_string());
        }
        if let Some(days) = self.trial_period_days {
            params.insert("trial_period_days", days.to_string());
        }
        if let Some(setup_fee) = self.setup_fee {
            params.insert("setup_fee", setup_fee.to_string());
        }
        if let Some(cost) = self.cost_per_month {
            params.insert("cost_per_month", cost.to_string());
        }
        params
    }

    fn changed_params(&self, existing: &PlanItem) -> Params {
        let mut params = Params::new();
        if let Some(name) = &self.name {
            track(&mut params, "name", name, &existing.name);
        }
        if let Some(approval) = &self.approval_required {
            track(&mut params, "approval_required", approval, &existing.approval_required);
        }
        if let Some(days) = self.trial_period_days {
            track(&mut params, "trial_period_days", &days, &existing.trial_period_days.unwrap_or(0));
        }
        track_fee(&mut params, "setup_fee", self.setup_fee, existing.setup_fee);
        track_fee(&mut params, "cost_per_month", self.cost_per_month, existing.cost_per_month);
        params
    }
}

/// Limit with its metric reference resolved to a remote ID
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredLimit {
    pub period: String,
    pub value: i64,
    pub metric_id: i64,
}

impl DesiredLimit {
    pub fn key(&self) -> String {
        limit_key(self.metric_id, &self.period)
    }
}

fn limit_key(metric_id: i64, period: &str) -> String {
    format!("{}:{}", metric_id, period)
}

impl TrackedEntity<LimitItem> for DesiredLimit {
    fn create_params(&self, _key: &str) -> Params {
        Params::from([
            ("period", self.period.clone()),
            ("value", self.value.to_string()),
        ])
    }

    fn changed_params(&self, existing: &LimitItem) -> Params {
        let mut params = Params::new();
        track(&mut params, "value", &self.value, &existing.value);
        params
    }
}

/// Pricing rule with its metric reference resolved and its price parsed
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredPricingRule {
    pub metric_id: i64,
    pub min: i64,
    pub max: i64,
    pub cost_per_unit: f64,
}

impl DesiredPricingRule {
    pub fn key(&self) -> String {
        pricing_rule_key(self.metric_id, self.min, self.max)
    }
}

fn pricing_rule_key(metric_id: i64, min: i64, max: i64) -> String {
    format!("{}:{}:{}", metric_id, min, max)
}

impl TrackedEntity<PricingRuleItem> for DesiredPricingRule {
    fn create_params(&self, _key: &str) -> Params {
        Params::from([
            ("cost_per_unit", self.cost_per_unit.to_string()),
            ("min", self.min.to_string()),
            ("max", self.max.to_string()),
        ])
    }

    fn changed_params(&self, existing: &PricingRuleItem) -> Params {
        let mut params = Params::new();
        track_fee(&mut params, "cost_per_unit", Some(self.cost_per_unit), Some(existing.cost_per_unit));
        params
    }
}

/// Resolves plan metric references, local or backend-scoped, to remote IDs
pub struct LimitResolver<'a> {
    gateway: &'a dyn RemoteAdminGateway,
    local: MetricIndex,
    backends: Option<BTreeMap<String, i64>>,
    backend_indexes: BTreeMap<i64, MetricIndex>,
}

impl<'a> LimitResolver<'a> {
    pub async fn new(gateway: &'a dyn RemoteAdminGateway, product_id: i64) -> Result<Self> {
        Ok(Self {
            gateway,
            local: MetricIndex::load(gateway, Owner::Product(product_id)).await?,
            backends: None,
            backend_indexes: BTreeMap::new(),
        })
    }

    pub async fn resolve(&mut self, reference: &MetricMethodRefSpec) -> Result<i64> {
        match &reference.backend_system_name {
            None => self.local.id(&reference.system_name).ok_or_else(|| {
                Error::Sync(format!("metric or method '{}' missing remotely", reference))
            }),
            Some(backend) => {
                let backend_id = self.backend_id(backend).await?;
                if !self.backend_indexes.contains_key(&backend_id) {
                    let index = MetricIndex::load(self.gateway, Owner::Backend(backend_id)).await?;
                    self.backend_indexes.insert(backend_id, index);
                }
                self.backend_indexes
                    .get(&backend_id)
                    .and_then(|index| index.id(&reference.system_name))
                    .ok_or_else(|| Error::orphan(format!("metric or method '{}' not found", reference)))
            }
        }
    }

    async fn backend_id(&mut self, system_name: &str) -> Result<i64> {
        if self.backends.is_none() {
            self.backends = Some(backend_ids(self.gateway).await?);
        }
        self.backends
            .as_ref()
            .and_then(|ids| ids.get(system_name).copied())
            .ok_or_else(|| Error::orphan(format!("backend '{}' not found", system_name)))
    }
}

/// Remote backend IDs by system name
pub async fn backend_ids(gateway: &dyn RemoteAdminGateway) -> Result<BTreeMap<String, i64>> {
    Ok(gateway
        .list_backends()
        .await?
        .into_iter()
        .map(|b| (b.system_name, b.id))
        .collect())
}

pub async fn sync_limits(
    gateway: &dyn RemoteAdminGateway,
    plan_id: i64,
    desired: Vec<DesiredLimit>,
) -> Result<Applied> {
    let desired: BTreeMap<String, DesiredLimit> =
        desired.into_iter().map(|l| (l.key(), l)).collect();
    let existing = gateway
        .list_limits(plan_id)
        .await?
        .into_iter()
        .map(|l| (limit_key(l.metric_id, &l.period), l))
        .collect();

    let result = diff(desired, existing);
    let mut applied = Applied::default();

    for (_, limit) in result.to_delete {
        gateway.delete_limit(plan_id, limit.metric_id, limit.id).await?;
        applied.deleted += 1;
    }
    for update in result.to_update {
        gateway
            .update_limit(plan_id, update.existing.metric_id, update.existing.id, &update.changes)
            .await?;
        applied.updated += 1;
    }
    for (key, limit) in result.to_create {
        gateway
            .create_limit(plan_id, limit.metric_id, &limit.create_params(&key))
            .await?;
        applied.created += 1;
    }

    Ok(applied.log("limit", format!("plan {}", plan_id)))
}

/// Pricing rules cannot be updated remotely, so a changed price is a delete and a create
pub async fn sync_pricing_rules(
    gateway: &dyn RemoteAdminGateway,
    plan_id: i64,
    desired: Vec<DesiredPricingRule>,
) -> Result<Applied> {
    let desired: BTreeMap<String, DesiredPricingRule> =
        desired.into_iter().map(|r| (r.key(), r)).collect();
    let existing = gateway
        .list_pricing_rules(plan_id)
        .await?
        .into_iter()
        .map(|r| (pricing_rule_key(r.metric_id, r.min, r.max), r))
        .collect();

    let result = diff(desired, existing);
    let mut applied = Applied::default();

    for (_, rule) in result.to_delete {
        gateway.delete_pricing_rule(plan_id, rule.metric_id, rule.id).await?;
        applied.deleted += 1;
    }
    for update in result.to_update {
        let existing = &update.existing;
        gateway
            .delete_pricing_rule(plan_id, existing.metric_id, existing.id)
            .await?;
        gateway
            .create_pricing_rule(plan_id, existing.metric_id, &update.desired.create_params(&update.key))
            .await?;
        applied.updated += 1;
    }
    for (key, rule) in result.to_create {
        gateway
            .create_pricing_rule(plan_id, rule.metric_id, &rule.create_params(&key))
            .await?;
        applied.created += 1;
    }

    Ok(applied.log("pricing rule", format!("plan {}", plan_id)))
}

/// Sync application plans, the default plan and every plan's limits and pricing rules
pub async fn sync_plans(
    gateway: &dyn RemoteAdminGateway,
    product_id: i64,
    desired: &BTreeMap<String, ApplicationPlanSpec>,
) -> Result<Applied> {
    let mut wanted = BTreeMap::new();
    for (key, spec) in desired {
        wanted.insert(key.clone(), DesiredPlan::from_spec(spec)?);
    }

    let existing = gateway
        .list_plans(product_id)
        .await?
        .into_iter()
        .map(|p| (p.system_name.clone(), p))
        .collect();

    let result = diff(wanted, existing);
    let mut applied = Applied::default();

    for (_, plan) in result.to_delete {
        gateway.delete_plan(product_id, plan.id).await?;
        applied.deleted += 1;
    }
    for update in result.to_update {
        gateway
            .update_plan(product_id, update.existing.id, &update.changes)
            .await?;
        applied.updated += 1;
    }
    for (key, plan) in result.to_create {
        gateway
            .create_plan(product_id, &plan.create_params(&key))
            .await?;
        applied.created += 1;
    }
    applied.log("application plan", Owner::Product(product_id));

    let plans: BTreeMap<String, PlanItem> = gateway
        .list_plans(product_id)
        .await?
        .into_iter()
        .map(|p| (p.system_name.clone(), p))
        .collect();

    let mut resolver = LimitResolver::new(gateway, product_id).await?;
    for (key, spec) in desired {
        let plan = plans
            .get(key)
            .ok_or_else(|| Error::Sync(format!("application plan '{}' missing remotely", key)))?;

        if spec.default && !plan.default {
            gateway.set_default_plan(product_id, plan.id).await?;
            info!(plan = %key, "Default application plan set");
        }

        let mut limits = Vec::with_capacity(spec.limits.len());
        for limit in &spec.limits {
            limits.push(DesiredLimit {
                period: limit.period.clone(),
                value: limit.value,
                metric_id: resolver.resolve(&limit.metric_method_ref).await?,
            });
        }
        sync_limits(gateway, plan.id, limits).await?;

        let mut rules = Vec::with_capacity(spec.pricing_rules.len());
        for rule in &spec.pricing_rules {
            rules.push(DesiredPricingRule {
                metric_id: resolver.resolve(&rule.metric_method_ref).await?,
                min: rule.from,
                max: rule.to,
                cost_per_unit: fee(&Some(rule.price_per_unit.clone()))?.unwrap_or_default(),
            });
        }
        sync_pricing_rules(gateway, plan.id, rules).await?;
    }

    Ok(applied)
}

// ============================================================================
// Backend usages
// ============================================================================

/// Backend usage with its backend resolved to a remote ID
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredBackendUsage {
    pub backend_id: i64,
    pub path: String,
}

impl TrackedEntity<BackendUsageItem> for DesiredBackendUsage {
    fn create_params(&self, _key: &str) -> Params {
        Params::from([
            ("backend_api_id", self.backend_id.to_string()),
            ("path", self.path.clone()),
        ])
    }

    fn changed_params(&self, existing: &BackendUsageItem) -> Params {
        let mut params = Params::new();
        track(&mut params, "path", &self.path, &existing.path);
        params
    }
}

/// Sync backend usages; a usage of a backend missing remotely is an orphan
pub async fn sync_backend_usages(
    gateway: &dyn RemoteAdminGateway,
    product_id: i64,
    desired: &BTreeMap<String, BackendUsageSpec>,
) -> Result<Applied> {
    let mut wanted = BTreeMap::new();
    if !desired.is_empty() {
        let ids = backend_ids(gateway).await?;
        for (system_name, usage) in desired {
            let backend_id = ids
                .get(system_name)
                .copied()
                .ok_or_else(|| Error::orphan(format!("backend '{}' not found", system_name)))?;
            wanted.insert(
                backend_id.to_string(),
                DesiredBackendUsage {
                    backend_id,
                    path: usage.path.clone(),
                },
            );
        }
    }

    let existing = gateway
        .list_backend_usages(product_id)
        .await?
        .into_iter()
        .map(|u| (u.backend_id.to_string(), u))
        .collect();

    let result = diff(wanted, existing);
    let mut applied = Applied::default();

    for (_, usage) in result.to_delete {
        gateway.delete_backend_usage(product_id, usage.id).await?;
        applied.deleted += 1;
    }
    for update in result.to_update {
        gateway
            .update_backend_usage(product_id, update.existing.id, &update.changes)
            .await?;
        applied.updated += 1;
    }
    for (key, usage) in result.to_create {
        gateway
            .create_backend_usage(product_id, &usage.create_params(&key))
            .await?;
        applied.created += 1;
    }

    Ok(applied.log("backend usage", Owner::Product(product_id)))
}
