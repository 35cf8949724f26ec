//! Spec defaults and validation for backends and products
//!
//! Validation failures are [`Error::InvalidSpec`]: retrying cannot help until
//! the resource is edited.

use std::collections::{BTreeMap, BTreeSet};

use crate::crd::common::{hits_metric, system_name_from, HITS_METRIC};
use crate::crd::{
    BackendSpec, MappingRuleSpec, MethodSpec, MetricMethodRefSpec, MetricSpec, ProductSpec,
};
use crate::error::{Error, Result};

pub const LIMIT_PERIODS: [&str; 7] = ["eternity", "year", "month", "week", "day", "hour", "minute"];

pub const HTTP_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH", "CONNECT",
];

fn default_entities(
    name: &str,
    system_name: &mut String,
    metrics: &mut BTreeMap<String, MetricSpec>,
) -> bool {
    let mut changed = false;
    if system_name.is_empty() {
        *system_name = system_name_from(name);
        changed = !system_name.is_empty();
    }
    if !metrics.contains_key(HITS_METRIC) {
        metrics.insert(HITS_METRIC.to_string(), hits_metric());
        changed = true;
    }
    changed
}

/// Fill in defaults; returns true when the spec changed
pub fn set_backend_defaults(spec: &mut BackendSpec) -> bool {
    default_entities(&spec.name, &mut spec.system_name, &mut spec.metrics)
}

/// Fill in defaults; returns true when the spec changed
pub fn set_product_defaults(spec: &mut ProductSpec) -> bool {
    default_entities(&spec.name, &mut spec.system_name, &mut spec.metrics)
}

/// System names of every metric and method of a spec
pub fn declared_names(
    metrics: &BTreeMap<String, MetricSpec>,
    methods: &BTreeMap<String, MethodSpec>,
) -> BTreeSet<String> {
    metrics.keys().chain(methods.keys()).cloned().collect()
}

fn validate_metrics_and_methods(
    metrics: &BTreeMap<String, MetricSpec>,
    methods: &BTreeMap<String, MethodSpec>,
) -> Result<()> {
    if !metrics.contains_key(HITS_METRIC) {
        return Err(Error::invalid("metrics must include 'hits'"));
    }

    if let Some(name) = metrics.keys().find(|k| methods.contains_key(*k)) {
        return Err(Error::invalid(format!(
            "system name '{}' is used by both a metric and a method",
            name
        )));
    }

    let mut friendly = BTreeSet::new();
    let names = metrics
        .values()
        .map(|m| &m.friendly_name)
        .chain(methods.values().map(|m| &m.friendly_name));
    for name in names {
        if !friendly.insert(name) {
            return Err(Error::invalid(format!("friendly name '{}' is not unique", name)));
        }
    }

    Ok(())
}

fn validate_system_name(system_name: &str) -> Result<()> {
    if system_name.is_empty() {
        return Err(Error::invalid(
            "systemName must not be empty; set it or use a name with letters or digits",
        ));
    }
    Ok(())
}

fn validate_mapping_rules(rules: &[MappingRuleSpec], declared: &BTreeSet<String>) -> Result<()> {
    let mut keys = BTreeSet::new();
    for rule in rules {
        let verb = rule.http_method.to_uppercase();
        if !HTTP_METHODS.contains(&verb.as_str()) {
            return Err(Error::invalid(format!(
                "mapping rule {}: '{}' is not an HTTP method",
                rule.key(),
                rule.http_method
            )));
        }
        if !rule.pattern.starts_with('/') {
            return Err(Error::invalid(format!(
                "mapping rule {}: pattern must start with '/'",
                rule.key()
            )));
        }
        if !declared.contains(&rule.metric_method_ref) {
            return Err(Error::invalid(format!(
                "mapping rule {} references unknown metric or method '{}'",
                rule.key(),
                rule.metric_method_ref
            )));
        }
        if !keys.insert(rule.key()) {
            return Err(Error::invalid(format!("mapping rule {} is duplicated", rule.key())));
        }
    }
    Ok(())
}

pub fn validate_backend(spec: &BackendSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(Error::invalid("name must not be empty"));
    }
    validate_system_name(&spec.system_name)?;
    let url = spec.private_base_url.as_str();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::invalid(format!(
            "privateBaseURL '{}' must be an http or https URL",
            url
        )));
    }

    validate_metrics_and_methods(&spec.metrics, &spec.methods)?;
    validate_mapping_rules(&spec.mapping_rules, &declared_names(&spec.metrics, &spec.methods))
}

pub fn validate_product(spec: &ProductSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(Error::invalid("name must not be empty"));
    }
    validate_system_name(&spec.system_name)?;

    validate_metrics_and_methods(&spec.metrics, &spec.methods)?;
    let declared = declared_names(&spec.metrics, &spec.methods);
    validate_mapping_rules(&spec.mapping_rules, &declared)?;

    let defaults = spec.application_plans.values().filter(|p| p.default).count();
    if defaults > 1 {
        return Err(Error::invalid("at most one application plan can be the default"));
    }

    for (key, plan) in &spec.application_plans {
        for (field, amount) in [("setupFee", &plan.setup_fee), ("costMonth", &plan.cost_month)] {
            if let Some(amount) = amount {
                if amount.trim().parse::<f64>().is_err() {
                    return Err(Error::invalid(format!(
                        "plan {}: {} '{}' is not a valid amount",
                        key, field, amount
                    )));
                }
            }
        }

        let mut limit_keys = BTreeSet::new();
        for limit in &plan.limits {
            let reference = &limit.metric_method_ref;
            if !LIMIT_PERIODS.contains(&limit.period.as_str()) {
                return Err(Error::invalid(format!(
                    "plan {}: limit period '{}' must be one of {}",
                    key,
                    limit.period,
                    LIMIT_PERIODS.join(", ")
                )));
            }
            validate_plan_reference(key, "limit", reference, &declared, spec)?;
            if !limit_keys.insert((reference.to_string(), limit.period.clone())) {
                return Err(Error::invalid(format!(
                    "plan {}: duplicate {} limit on '{}'",
                    key, limit.period, reference
                )));
            }
        }

        let mut ranges: Vec<(String, i64, i64)> = Vec::with_capacity(plan.pricing_rules.len());
        for rule in &plan.pricing_rules {
            let reference = &rule.metric_method_ref;
            if rule.price_per_unit.trim().parse::<f64>().map_or(true, |p| p < 0.0) {
                return Err(Error::invalid(format!(
                    "plan {}: pricePerUnit '{}' is not a valid amount",
                    key, rule.price_per_unit
                )));
            }
            if rule.from < 0 || rule.to < rule.from {
                return Err(Error::invalid(format!(
                    "plan {}: pricing rule range {}..{} on '{}' must satisfy 0 <= from <= to",
                    key, rule.from, rule.to, reference
                )));
            }
            validate_plan_reference(key, "pricing rule", reference, &declared, spec)?;
            let metric = reference.to_string();
            if let Some((_, from, to)) = ranges
                .iter()
                .find(|(m, from, to)| *m == metric && rule.from <= *to && *from <= rule.to)
            {
                return Err(Error::invalid(format!(
                    "plan {}: pricing rule range {}..{} on '{}' overlaps {}..{}",
                    key, rule.from, rule.to, reference, from, to
                )));
            }
            ranges.push((metric, rule.from, rule.to));
        }
    }

    for (backend, usage) in &spec.backend_usages {
        if !usage.path.starts_with('/') {
            return Err(Error::invalid(format!(
                "backend usage {}: path must start with '/'",
                backend
            )));
        }
    }

    Ok(())
}

fn validate_plan_reference(
    plan: &str,
    what: &str,
    reference: &MetricMethodRefSpec,
    declared: &BTreeSet<String>,
    spec: &ProductSpec,
) -> Result<()> {
    match &reference.backend_system_name {
        None if !declared.contains(&reference.system_name) => Err(Error::invalid(format!(
            "plan {}: {} references unknown metric or method '{}'",
            plan, what, reference
        ))),
        Some(backend) if !spec.backend_usages.contains_key(backend) => Err(Error::invalid(format!(
            "plan {}: {} references backend '{}' not listed in backendUsages",
            plan, what, backend
        ))),
        _ => Ok(()),
    }
}
