//! In-memory fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use threescale_operator::clock::Clock;
use threescale_operator::cluster::ClusterStore;
use threescale_operator::events::EventPublisher;
use threescale_operator::remote::{
    BackendApiItem, BackendUsageItem, GatewayFactory, LimitItem, MappingRuleItem, MethodItem,
    MetricItem, Owner, Params, PlanItem, PricingRuleItem, ProductItem, ProviderAccount,
    RemoteAdminGateway,
};
use threescale_operator::{Error, Result};

pub const NAMESPACE: &str = "3scale";
pub const ADMIN_URL: &str = "https://admin.example.com";

// ============================================================================
// Clock
// ============================================================================

pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at(secs: i64) -> Self {
        Self(Utc.timestamp_opt(secs, 0).single().unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Default)]
pub struct RecordingEvents {
    published: Mutex<Vec<(EventType, String, Option<String>)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _object: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.published
            .lock()
            .unwrap()
            .push((type_, reason.to_string(), note));
    }
}

// ============================================================================
// Cluster store
// ============================================================================

/// Namespaced object store with resource versions
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    version: AtomicU64,
    status_writes: AtomicUsize,
    updates: AtomicUsize,
    conflict_next_status_write: AtomicBool,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            status_writes: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            conflict_next_status_write: AtomicBool::new(false),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, obj: &mut K) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.meta_mut().resource_version = Some(version.to_string());
    }

    fn key(namespace: &str, obj: &K) -> (String, String) {
        (namespace.to_string(), obj.name_any())
    }

    /// Seed an object, returning it with its resource version
    pub fn insert(&self, mut obj: K) -> K {
        let namespace = obj.namespace().unwrap_or_else(|| NAMESPACE.to_string());
        self.bump(&mut obj);
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key(&namespace, &obj), obj.clone());
        obj
    }

    pub fn fetch(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Mutate a stored object in place, as another actor would
    pub fn modify(&self, namespace: &str, name: &str, change: impl FnOnce(&mut K)) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("object to modify");
        change(obj);
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.meta_mut().resource_version = Some(version.to_string());
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn names(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn conflict_on_next_status_write(&self) {
        self.conflict_next_status_write.store(true, Ordering::SeqCst);
    }

    fn check_version(&self, stored: &K, obj: &K) -> Result<()> {
        match obj.resource_version() {
            Some(version) if Some(&version) != stored.resource_version().as_ref() => {
                Err(Error::Conflict(obj.name_any()))
            }
            _ => Ok(()),
        }
    }

    fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        let key = Self::key(namespace, obj);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::Conflict(format!("{} does not exist", obj.name_any())))?;
        self.check_version(stored, obj)?;
        let mut updated = obj.clone();
        self.bump(&mut updated);
        objects.insert(key, updated.clone());
        Ok(updated)
    }
}

fn matches_selector<K: Resource>(obj: &K, selector: Option<&str>) -> bool {
    let Some(selector) = selector.filter(|s| !s.is_empty()) else {
        return true;
    };
    let labels = obj.labels();
    selector.split(',').all(|pair| match pair.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => labels.contains_key(pair),
    })
}

/// JSON merge patch (RFC 7386): `null` removes a key, objects merge, anything else replaces
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(existing) = target {
        for (key, value) in fields {
            if value.is_null() {
                existing.remove(key);
            } else {
                merge_patch(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[async_trait]
impl<K> ClusterStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.fetch(namespace, name))
    }

    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), obj)| ns == namespace && matches_selector(*obj, label_selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let key = Self::key(namespace, obj);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{} already exists", obj.name_any())));
        }
        let mut created = obj.clone();
        self.bump(&mut created);
        objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<K> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.replace(namespace, obj)
    }

    /// Same body and merge semantics as the API server's status merge patch
    async fn update_status(&self, namespace: &str, obj: &K) -> Result<K> {
        if self.conflict_next_status_write.swap(false, Ordering::SeqCst) {
            return Err(Error::Conflict(obj.name_any()));
        }
        let key = Self::key(namespace, obj);
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::Conflict(format!("{} does not exist", obj.name_any())))?;
        self.check_version(stored, obj)?;

        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        let mut merged = serde_json::to_value(stored)?;
        merge_patch(&mut merged, &json!({ "status": status }));
        let mut updated: K = serde_json::from_value(merged)?;
        self.bump(&mut updated);
        objects.insert(key, updated.clone());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.remove(namespace, name);
        Ok(())
    }
}

pub fn provider_secret(name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("adminURL".to_string(), ByteString(ADMIN_URL.as_bytes().to_vec())),
            ("token".to_string(), ByteString(b"s3cr3t".to_vec())),
        ])),
        ..Default::default()
    }
}

// ============================================================================
// Admin API
// ============================================================================

#[derive(Default)]
pub struct Tables {
    pub backends: BTreeMap<i64, BackendApiItem>,
    pub products: BTreeMap<i64, ProductItem>,
    pub methods: BTreeMap<i64, (Owner, MethodItem)>,
    pub metrics: BTreeMap<i64, (Owner, MetricItem)>,
    pub mapping_rules: BTreeMap<i64, (Owner, MappingRuleItem)>,
    pub plans: BTreeMap<i64, (i64, PlanItem)>,
    pub limits: BTreeMap<i64, (i64, LimitItem)>,
    pub pricing_rules: BTreeMap<i64, (i64, PricingRuleItem)>,
    pub backend_usages: BTreeMap<i64, (i64, BackendUsageItem)>,
}

/// Admin API backed by in-memory tables, recording every call
#[derive(Default)]
pub struct FakeGateway {
    pub tables: Mutex<Tables>,
    next_id: AtomicI64,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

fn text(params: &Params, key: &str) -> String {
    params.get(key).cloned().unwrap_or_default()
}

fn parsed<T: std::str::FromStr>(params: &Params, key: &str) -> Option<T> {
    params.get(key).and_then(|v| v.parse().ok())
}

fn not_found(what: &str, id: i64) -> Error {
    Error::RemoteNotFound(format!("{} {}", what, id))
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(100),
            ..Default::default()
        })
    }

    fn id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, op: &str) -> Result<()> {
        self.calls.lock().unwrap().push(op.to_string());
        if self.fail_on.lock().unwrap().as_deref() == Some(op) {
            return Err(Error::Remote {
                status: 500,
                message: format!("{} failed", op),
            });
        }
        Ok(())
    }

    /// Make every later call of `op` fail with a server error
    pub fn fail_on(&self, op: &str) {
        *self.fail_on.lock().unwrap() = Some(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that changed remote state
    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.starts_with("create_")
                    || c.starts_with("update_")
                    || c.starts_with("delete_")
                    || c.starts_with("set_")
            })
            .collect()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Seed a backend with a `hits` metric, returning the backend ID
    pub fn seed_backend(&self, system_name: &str) -> i64 {
        let id = self.id();
        let metric_id = self.id();
        let mut tables = self.tables.lock().unwrap();
        tables.backends.insert(
            id,
            BackendApiItem {
                id,
                name: system_name.to_string(),
                system_name: system_name.to_string(),
                description: None,
                private_endpoint: "https://backend.internal".to_string(),
            },
        );
        tables.metrics.insert(
            metric_id,
            (
                Owner::Backend(id),
                MetricItem {
                    id: metric_id,
                    friendly_name: "Hits".to_string(),
                    system_name: "hits".to_string(),
                    unit: "hit".to_string(),
                    description: None,
                    parent_id: None,
                },
            ),
        );
        id
    }

    pub fn seed_product(&self, system_name: &str) -> i64 {
        let id = self.id();
        self.tables.lock().unwrap().products.insert(
            id,
            ProductItem {
                id,
                name: system_name.to_string(),
                system_name: system_name.to_string(),
                state: Some("incomplete".to_string()),
                ..Default::default()
            },
        );
        id
    }

    pub fn product_named(&self, system_name: &str) -> Option<ProductItem> {
        self.tables
            .lock()
            .unwrap()
            .products
            .values()
            .find(|p| p.system_name == system_name)
            .cloned()
    }

    pub fn backend_named(&self, system_name: &str) -> Option<BackendApiItem> {
        self.tables
            .lock()
            .unwrap()
            .backends
            .values()
            .find(|b| b.system_name == system_name)
            .cloned()
    }

    pub fn metrics_of(&self, owner: Owner) -> Vec<MetricItem> {
        self.tables
            .lock()
            .unwrap()
            .metrics
            .values()
            .filter(|(o, _)| *o == owner)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn mapping_rules_of(&self, owner: Owner) -> Vec<MappingRuleItem> {
        self.tables
            .lock()
            .unwrap()
            .mapping_rules
            .values()
            .filter(|(o, _)| *o == owner)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn plans_of(&self, product_id: i64) -> Vec<PlanItem> {
        self.tables
            .lock()
            .unwrap()
            .plans
            .values()
            .filter(|(p, _)| *p == product_id)
            .map(|(_, plan)| plan.clone())
            .collect()
    }

    pub fn limits_of(&self, plan_id: i64) -> Vec<LimitItem> {
        self.tables
            .lock()
            .unwrap()
            .limits
            .values()
            .filter(|(p, _)| *p == plan_id)
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn pricing_rules_of(&self, plan_id: i64) -> Vec<PricingRuleItem> {
        self.tables
            .lock()
            .unwrap()
            .pricing_rules
            .values()
            .filter(|(p, _)| *p == plan_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn usages_of(&self, product_id: i64) -> Vec<BackendUsageItem> {
        self.tables
            .lock()
            .unwrap()
            .backend_usages
            .values()
            .filter(|(p, _)| *p == product_id)
            .map(|(_, u)| u.clone())
            .collect()
    }

    fn remove_owned(tables: &mut Tables, owner: Owner) {
        tables.methods.retain(|_, (o, _)| *o != owner);
        tables.metrics.retain(|_, (o, _)| *o != owner);
        tables.mapping_rules.retain(|_, (o, _)| *o != owner);
    }
}

#[async_trait]
impl RemoteAdminGateway for FakeGateway {
    async fn list_backends(&self) -> Result<Vec<BackendApiItem>> {
        self.record("list_backends")?;
        Ok(self.tables.lock().unwrap().backends.values().cloned().collect())
    }

    async fn create_backend(&self, params: &Params) -> Result<BackendApiItem> {
        self.record("create_backend")?;
        let item = BackendApiItem {
            id: self.id(),
            name: text(params, "name"),
            system_name: text(params, "system_name"),
            description: params.get("description").cloned(),
            private_endpoint: text(params, "private_endpoint"),
        };
        self.tables.lock().unwrap().backends.insert(item.id, item.clone());
        Ok(item)
    }

    async fn update_backend(&self, id: i64, params: &Params) -> Result<BackendApiItem> {
        self.record("update_backend")?;
        let mut tables = self.tables.lock().unwrap();
        let item = tables.backends.get_mut(&id).ok_or_else(|| not_found("backend", id))?;
        if let Some(v) = params.get("name") {
            item.name = v.clone();
        }
        if let Some(v) = params.get("private_endpoint") {
            item.private_endpoint = v.clone();
        }
        if let Some(v) = params.get("description") {
            item.description = Some(v.clone());
        }
        Ok(item.clone())
    }

    async fn delete_backend(&self, id: i64) -> Result<()> {
        self.record("delete_backend")?;
        let mut tables = self.tables.lock().unwrap();
        tables.backends.remove(&id).ok_or_else(|| not_found("backend", id))?;
        Self::remove_owned(&mut tables, Owner::Backend(id));
        Ok(())
    }

    async fn list_products(&self) -> Result<Vec<ProductItem>> {
        self.record("list_products")?;
        Ok(self.tables.lock().unwrap().products.values().cloned().collect())
    }

    async fn create_product(&self, params: &Params) -> Result<ProductItem> {
        self.record("create_product")?;
        let item = ProductItem {
            id: self.id(),
            name: text(params, "name"),
            system_name: text(params, "system_name"),
            description: params.get("description").cloned(),
            state: Some("incomplete".to_string()),
            deployment_option: params.get("deployment_option").cloned(),
            backend_version: params.get("backend_version").cloned(),
        };
        self.tables.lock().unwrap().products.insert(item.id, item.clone());
        Ok(item)
    }

    async fn update_product(&self, id: i64, params: &Params) -> Result<ProductItem> {
        self.record("update_product")?;
        let mut tables = self.tables.lock().unwrap();
        let item = tables.products.get_mut(&id).ok_or_else(|| not_found("product", id))?;
        if let Some(v) = params.get("name") {
            item.name = v.clone();
        }
        if let Some(v) = params.get("description") {
            item.description = Some(v.clone());
        }
        if let Some(v) = params.get("deployment_option") {
            item.deployment_option = Some(v.clone());
        }
        if let Some(v) = params.get("backend_version") {
            item.backend_version = Some(v.clone());
        }
        Ok(item.clone())
    }

    async fn delete_product(&self, id: i64) -> Result<()> {
        self.record("delete_product")?;
        let mut tables = self.tables.lock().unwrap();
        tables.products.remove(&id).ok_or_else(|| not_found("product", id))?;
        Self::remove_owned(&mut tables, Owner::Product(id));
        let plans: Vec<i64> = tables
            .plans
            .iter()
            .filter(|(_, (p, _))| *p == id)
            .map(|(plan_id, _)| *plan_id)
            .collect();
        tables.plans.retain(|_, (p, _)| *p != id);
        tables.limits.retain(|_, (plan, _)| !plans.contains(plan));
        tables.pricing_rules.retain(|_, (plan, _)| !plans.contains(plan));
        tables.backend_usages.retain(|_, (p, _)| *p != id);
        Ok(())
    }

    async fn list_methods(&self, owner: Owner) -> Result<Vec<MethodItem>> {
        self.record("list_methods")?;
        Ok(self
            .tables
            .lock()
            .unwrap()
            .methods
            .values()
            .filter(|(o, _)| *o == owner)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn create_method(&self, owner: Owner, params: &Params) -> Result<MethodItem> {
        self.record("create_method")?;
        let item = MethodItem {
            id: self.id(),
            friendly_name: text(params, "friendly_name"),
            system_name: text(params, "system_name"),
            description: params.get("description").cloned(),
        };
        self.tables
            .lock()
            .unwrap()
            .methods
            .insert(item.id, (owner, item.clone()));
        Ok(item)
    }

    async fn update_method(&self, _owner: Owner, id: i64, params: &Params) -> Result<MethodItem> {
        self.record("update_method")?;
        let mut tables = self.tables.lock().unwrap();
        let (_, item) = tables.methods.get_mut(&id).ok_or_else(|| not_found("method", id))?;
        if let Some(v) = params.get("friendly_name") {
            item.friendly_name = v.clone();
        }
        if let Some(v) = params.get("description") {
            item.description = Some(v.clone());
        }
        Ok(item.clone())
    }

    async fn delete_method(&self, _owner: Owner, id: i64) -> Result<()> {
        self.record("delete_method")?;
        let mut tables = self.tables.lock().unwrap();
        tables.methods.remove(&id).ok_or_else(|| not_found("method", id))?;
        tables.mapping_rules.retain(|_, (_, r)| r.metric_id != id);
        Ok(())
    }

    async fn list_metrics(&self, owner: Owner) -> Result<Vec<MetricItem>> {
        self.record("list_metrics")?;
        Ok(self.metrics_of(owner))
    }

    async fn create_metric(&self, owner: Owner, params: &Params) -> Result<MetricItem> {
        self.record("create_metric")?;
        let item = MetricItem {
            id: self.id(),
            friendly_name: text(params, "friendly_name"),
            system_name: text(params, "system_name"),
            unit: text(params, "unit"),
            description: params.get("description").cloned(),
            parent_id: None,
        };
        self.tables
            .lock()
            .unwrap()
            .metrics
            .insert(item.id, (owner, item.clone()));
        Ok(item)
    }

    async fn update_metric(&self, _owner: Owner, id: i64, params: &Params) -> Result<MetricItem> {
        self.record("update_metric")?;
        let mut tables = self.tables.lock().unwrap();
        let (_, item) = tables.metrics.get_mut(&id).ok_or_else(|| not_found("metric", id))?;
        if let Some(v) = params.get("friendly_name") {
            item.friendly_name = v.clone();
        }
        if let Some(v) = params.get("unit") {
            item.unit = v.clone();
        }
        if let Some(v) = params.get("description") {
            item.description = Some(v.clone());
        }
        Ok(item.clone())
    }

    async fn delete_metric(&self, _owner: Owner, id: i64) -> Result<()> {
        self.record("delete_metric")?;
        let mut tables = self.tables.lock().unwrap();
        tables.metrics.remove(&id).ok_or_else(|| not_found("metric", id))?;
        tables.mapping_rules.retain(|_, (_, r)| r.metric_id != id);
        Ok(())
    }

    async fn list_mapping_rules(&self, owner: Owner) -> Result<Vec<MappingRuleItem>> {
        self.record("list_mapping_rules")?;
        Ok(self.mapping_rules_of(owner))
    }

    async fn create_mapping_rule(&self, owner: Owner, params: &Params) -> Result<MappingRuleItem> {
        self.record("create_mapping_rule")?;
        let item = MappingRuleItem {
            id: self.id(),
            http_method: text(params, "http_method"),
            pattern: text(params, "pattern"),
            metric_id: parsed(params, "metric_id").unwrap_or_default(),
            delta: parsed(params, "delta").unwrap_or_default(),
            last: parsed(params, "last").unwrap_or_default(),
        };
        self.tables
            .lock()
            .unwrap()
            .mapping_rules
            .insert(item.id, (owner, item.clone()));
        Ok(item)
    }

    async fn update_mapping_rule(
        &self,
        _owner: Owner,
        id: i64,
        params: &Params,
    ) -> Result<MappingRuleItem> {
        self.record("update_mapping_rule")?;
        let mut tables = self.tables.lock().unwrap();
        let (_, item) = tables
            .mapping_rules
            .get_mut(&id)
            .ok_or_else(|| not_found("mapping rule", id))?;
        if let Some(v) = parsed(params, "metric_id") {
            item.metric_id = v;
        }
        if let Some(v) = parsed(params, "delta") {
            item.delta = v;
        }
        if let Some(v) = parsed(params, "last") {
            item.last = v;
        }
        Ok(item.clone())
    }

    async fn delete_mapping_rule(&self, _owner: Owner, id: i64) -> Result<()> {
        self.record("delete_mapping_rule")?;
        self.tables
            .lock()
            .unwrap()
            .mapping_rules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("mapping rule", id))
    }

    async fn list_plans(&self, product_id: i64) -> Result<Vec<PlanItem>> {
        self.record("list_plans")?;
        Ok(self.plans_of(product_id))
    }

    async fn create_plan(&self, product_id: i64, params: &Params) -> Result<PlanItem> {
        self.record("create_plan")?;
        let item = PlanItem {
            id: self.id(),
            name: text(params, "name"),
            system_name: text(params, "system_name"),
            state: Some("published".to_string()),
            approval_required: parsed(params, "approval_required").unwrap_or(false),
            trial_period_days: parsed(params, "trial_period_days"),
            setup_fee: parsed(params, "setup_fee"),
            cost_per_month: parsed(params, "cost_per_month"),
            default: false,
        };
        self.tables
            .lock()
            .unwrap()
            .plans
            .insert(item.id, (product_id, item.clone()));
        Ok(item)
    }

    async fn update_plan(&self, _product_id: i64, id: i64, params: &Params) -> Result<PlanItem> {
        self.record("update_plan")?;
        let mut tables = self.tables.lock().unwrap();
        let (_, item) = tables.plans.get_mut(&id).ok_or_else(|| not_found("plan", id))?;
        if let Some(v) = params.get("name") {
            item.name = v.clone();
        }
        if let Some(v) = parsed(params, "approval_required") {
            item.approval_required = v;
        }
        if let Some(v) = parsed(params, "trial_period_days") {
            item.trial_period_days = Some(v);
        }
        if let Some(v) = parsed(params, "setup_fee") {
            item.setup_fee = Some(v);
        }
        if let Some(v) = parsed(params, "cost_per_month") {
            item.cost_per_month = Some(v);
        }
        Ok(item.clone())
    }

    async fn delete_plan(&self, _product_id: i64, id: i64) -> Result<()> {
        self.record("delete_plan")?;
        let mut tables = self.tables.lock().unwrap();
        tables.plans.remove(&id).ok_or_else(|| not_found("plan", id))?;
        tables.limits.retain(|_, (plan, _)| *plan != id);
        tables.pricing_rules.retain(|_, (plan, _)| *plan != id);
        Ok(())
    }

    async fn set_default_plan(&self, product_id: i64, id: i64) -> Result<PlanItem> {
        self.record("set_default_plan")?;
        let mut tables = self.tables.lock().unwrap();
        if !tables.plans.contains_key(&id) {
            return Err(not_found("plan", id));
        }
        for (plan_id, (owner, plan)) in tables.plans.iter_mut() {
            if *owner == product_id {
                plan.default = *plan_id == id;
            }
        }
        Ok(tables.plans[&id].1.clone())
    }

    async fn list_limits(&self, plan_id: i64) -> Result<Vec<LimitItem>> {
        self.record("list_limits")?;
        Ok(self.limits_of(plan_id))
    }

    async fn create_limit(&self, plan_id: i64, metric_id: i64, params: &Params) -> Result<LimitItem> {
        self.record("create_limit")?;
        let item = LimitItem {
            id: self.id(),
            period: text(params, "period"),
            value: parsed(params, "value").unwrap_or_default(),
            metric_id,
        };
        self.tables
            .lock()
            .unwrap()
            .limits
            .insert(item.id, (plan_id, item.clone()));
        Ok(item)
    }

    async fn update_limit(
        &self,
        _plan_id: i64,
        _metric_id: i64,
        id: i64,
        params: &Params,
    ) -> Result<LimitItem> {
        self.record("update_limit")?;
        let mut tables = self.tables.lock().unwrap();
        let (_, item) = tables.limits.get_mut(&id).ok_or_else(|| not_found("limit", id))?;
        if let Some(v) = parsed(params, "value") {
            item.value = v;
        }
        Ok(item.clone())
    }

    async fn delete_limit(&self, _plan_id: i64, _metric_id: i64, id: i64) -> Result<()> {
        self.record("delete_limit")?;
        self.tables
            .lock()
            .unwrap()
            .limits
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("limit", id))
    }

    async fn list_pricing_rules(&self, plan_id: i64) -> Result<Vec<PricingRuleItem>> {
        self.record("list_pricing_rules")?;
        Ok(self.pricing_rules_of(plan_id))
    }

    async fn create_pricing_rule(
        &self,
        plan_id: i64,
        metric_id: i64,
        params: &Params,
    ) -> Result<PricingRuleItem> {
        self.record("create_pricing_rule")?;
        let item = PricingRuleItem {
            id: self.id(),
            metric_id,
            cost_per_unit: parsed(params, "cost_per_unit").unwrap_or_default(),
            min: parsed(params, "min").unwrap_or_default(),
            max: parsed(params, "max").unwrap_or_default(),
        };
        self.tables
            .lock()
            .unwrap()
            .pricing_rules
            .insert(item.id, (plan_id, item.clone()));
        Ok(item)
    }

    async fn delete_pricing_rule(&self, _plan_id: i64, _metric_id: i64, id: i64) -> Result<()> {
        self.record("delete_pricing_rule")?;
        self.tables
            .lock()
            .unwrap()
            .pricing_rules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("pricing rule", id))
    }

    async fn list_backend_usages(&self, product_id: i64) -> Result<Vec<BackendUsageItem>> {
        self.record("list_backend_usages")?;
        Ok(self.usages_of(product_id))
    }

    async fn create_backend_usage(&self, product_id: i64, params: &Params) -> Result<BackendUsageItem> {
        self.record("create_backend_usage")?;
        let item = BackendUsageItem {
            id: self.id(),
            path: text(params, "path"),
            backend_id: parsed(params, "backend_api_id").unwrap_or_default(),
            service_id: product_id,
        };
        self.tables
            .lock()
            .unwrap()
            .backend_usages
            .insert(item.id, (product_id, item.clone()));
        Ok(item)
    }

    async fn update_backend_usage(
        &self,
        _product_id: i64,
        id: i64,
        params: &Params,
    ) -> Result<BackendUsageItem> {
        self.record("update_backend_usage")?;
        let mut tables = self.tables.lock().unwrap();
        let (_, item) = tables
            .backend_usages
            .get_mut(&id)
            .ok_or_else(|| not_found("backend usage", id))?;
        if let Some(v) = params.get("path") {
            item.path = v.clone();
        }
        Ok(item.clone())
    }

    async fn delete_backend_usage(&self, _product_id: i64, id: i64) -> Result<()> {
        self.record("delete_backend_usage")?;
        self.tables
            .lock()
            .unwrap()
            .backend_usages
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("backend usage", id))
    }
}

/// Hands out the same fake for every account, remembering which accounts asked
pub struct FakeFactory {
    pub gateway: Arc<FakeGateway>,
    pub accounts: Mutex<Vec<ProviderAccount>>,
}

impl FakeFactory {
    pub fn new(gateway: Arc<FakeGateway>) -> Self {
        Self {
            gateway,
            accounts: Mutex::new(Vec::new()),
        }
    }
}

impl GatewayFactory for FakeFactory {
    fn gateway(&self, account: &ProviderAccount) -> Result<Arc<dyn RemoteAdminGateway>> {
        self.accounts.lock().unwrap().push(account.clone());
        Ok(self.gateway.clone())
    }
}
