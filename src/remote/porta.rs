//! HTTP implementation of the admin gateway

use async_trait::async_trait;
use reqwest::{header::ACCEPT, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::model::*;
use super::{ProviderAccount, RemoteAdminGateway};
use crate::error::{Error, Result};
use crate::metrics;

const PER_PAGE: usize = 500;

/// Admin API client authenticating with a provider access token
pub struct PortaClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PortaClient {
    pub fn new(account: &ProviderAccount) -> Result<Self> {
        Self::with_http_client(reqwest::Client::new(), account)
    }

    pub fn with_http_client(http: reqwest::Client, account: &ProviderAccount) -> Result<Self> {
        let base_url = account.admin_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(Error::config(format!(
                "admin URL must be http(s): '{}'",
                account.admin_url
            )));
        }
        if account.token.is_empty() {
            return Err(Error::config("provider account token is empty"));
        }

        Ok(Self {
            http,
            base_url,
            token: account.token.clone(),
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        params: Option<&Params>,
    ) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .basic_auth("", Some(&self.token))
            .header(ACCEPT, "application/json")
            .query(query);
        if let Some(params) = params {
            req = req.form(params);
        }

        let response = req.send().await?;
        let status = response.status();
        debug!(method = %method, path = %path, status = status.as_u16(), "Admin API call");
        metrics::REMOTE_OPERATIONS
            .with_label_values(&[method.as_str(), outcome(status)])
            .inc();

        if status == StatusCode::NOT_FOUND {
            return Err(Error::RemoteNotFound(path.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Remote {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        list_tag: &str,
        item_tag: &str,
    ) -> Result<Vec<T>> {
        let body = self.request(Method::GET, path, &[], None).await?;
        unwrap_list(body.unwrap_or(Value::Null), list_tag, item_tag)
    }

    /// Follow `page` until a short page is returned
    async fn get_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        list_tag: &str,
        item_tag: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let query = [("page", page.to_string()), ("per_page", PER_PAGE.to_string())];
            let body = self.request(Method::GET, path, &query, None).await?;
            let batch: Vec<T> = unwrap_list(body.unwrap_or(Value::Null), list_tag, item_tag)?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                return Ok(items);
            }
            page += 1;
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &Params,
        item_tag: &str,
    ) -> Result<T> {
        let body = self.request(method, path, &[], Some(params)).await?;
        unwrap_item(body.unwrap_or(Value::Null), item_tag)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.request(Method::DELETE, path, &[], None).await?;
        Ok(())
    }

    async fn hits_id(&self, owner: Owner) -> Result<i64> {
        self.list_metrics(owner)
            .await?
            .into_iter()
            .find(|m| m.system_name == crate::crd::common::HITS_METRIC)
            .map(|m| m.id)
            .ok_or_else(|| Error::RemoteNotFound(format!("hits metric of {}", owner)))
    }
}

fn outcome(status: StatusCode) -> &'static str {
    if status.is_success() {
        "success"
    } else if status.is_client_error() {
        "client_error"
    } else {
        "server_error"
    }
}

fn owner_path(owner: Owner) -> String {
    match owner {
        Owner::Backend(id) => format!("/admin/api/backend_apis/{}", id),
        Owner::Product(id) => format!("/admin/api/services/{}", id),
    }
}

fn mapping_rules_path(owner: Owner) -> String {
    match owner {
        Owner::Backend(_) => format!("{}/mapping_rules", owner_path(owner)),
        Owner::Product(_) => format!("{}/proxy/mapping_rules", owner_path(owner)),
    }
}

/// Backend metric system names come back suffixed with `.<backend id>`
fn local_system_name(owner: Owner, system_name: &str) -> String {
    match owner {
        Owner::Backend(id) => system_name
            .strip_suffix(&format!(".{}", id))
            .unwrap_or(system_name)
            .to_string(),
        Owner::Product(_) => system_name.to_string(),
    }
}

/// Unwrap `{"<tag>": {...}}`
fn unwrap_item<T: DeserializeOwned>(body: Value, tag: &str) -> Result<T> {
    match body {
        Value::Object(mut map) if map.contains_key(tag) => {
            Ok(serde_json::from_value(map.remove(tag).unwrap_or_default())?)
        }
        other => Ok(serde_json::from_value(other)?),
    }
}

/// Unwrap `{"<list_tag>": [{"<item_tag>": {...}}, ...]}` or a bare array
fn unwrap_list<T: DeserializeOwned>(body: Value, list_tag: &str, item_tag: &str) -> Result<Vec<T>> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove(list_tag) {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    entries
        .into_iter()
        .map(|entry| unwrap_item(entry, item_tag))
        .collect()
}

#[async_trait]
impl RemoteAdminGateway for PortaClient {
    async fn list_backends(&self) -> Result<Vec<BackendApiItem>> {
        self.get_paged("/admin/api/backend_apis.json", "backend_apis", "backend_api")
            .await
    }

    async fn create_backend(&self, params: &Params) -> Result<BackendApiItem> {
        self.send(Method::POST, "/admin/api/backend_apis.json", params, "backend_api")
            .await
    }

    async fn update_backend(&self, id: i64, params: &Params) -> Result<BackendApiItem> {
        let path = format!("/admin/api/backend_apis/{}.json", id);
        self.send(Method::PUT, &path, params, "backend_api").await
    }

    async fn delete_backend(&self, id: i64) -> Result<()> {
        self.delete(&format!("/admin/api/backend_apis/{}.json", id))
            .await
    }

    async fn list_products(&self) -> Result<Vec<ProductItem>> {
        self.get_paged("/admin/api/services.json", "services", "service")
            .await
    }

    async fn create_product(&self, params: &Params) -> Result<ProductItem> {
        self.send(Method::POST, "/admin/api/services.json", params, "service")
            .await
    }

    async fn update_product(&self, id: i64, params: &Params) -> Result<ProductItem> {
        let path = format!("/admin/api/services/{}.json", id);
        self.send(Method::PUT, &path, params, "service").await
    }

    async fn delete_product(&self, id: i64) -> Result<()> {
        self.delete(&format!("/admin/api/services/{}.json", id)).await
    }

    async fn list_methods(&self, owner: Owner) -> Result<Vec<MethodItem>> {
        let hits = self.hits_id(owner).await?;
        let path = format!("{}/metrics/{}/methods.json", owner_path(owner), hits);
        let mut methods: Vec<MethodItem> = self.get_list(&path, "methods", "method").await?;
        for method in methods.iter_mut() {
            method.system_name = local_system_name(owner, &method.system_name);
        }
        Ok(methods)
    }

    async fn create_method(&self, owner: Owner, params: &Params) -> Result<MethodItem> {
        let hits = self.hits_id(owner).await?;
        let path = format!("{}/metrics/{}/methods.json", owner_path(owner), hits);
        self.send(Method::POST, &path, params, "method").await
    }

    async fn update_method(&self, owner: Owner, id: i64, params: &Params) -> Result<MethodItem> {
        let hits = self.hits_id(owner).await?;
        let path = format!("{}/metrics/{}/methods/{}.json", owner_path(owner), hits, id);
        self.send(Method::PUT, &path, params, "method").await
    }

    async fn delete_method(&self, owner: Owner, id: i64) -> Result<()> {
        let hits = self.hits_id(owner).await?;
        self.delete(&format!(
            "{}/metrics/{}/methods/{}.json",
            owner_path(owner),
            hits,
            id
        ))
        .await
    }

    async fn list_metrics(&self, owner: Owner) -> Result<Vec<MetricItem>> {
        let path = format!("{}/metrics.json", owner_path(owner));
        let metrics: Vec<MetricItem> = self.get_list(&path, "metrics", "metric").await?;
        Ok(metrics
            .into_iter()
            .filter(|m| m.parent_id.is_none())
            .map(|mut m| {
                m.system_name = local_system_name(owner, &m.system_name);
                m
            })
            .collect())
    }

    async fn create_metric(&self, owner: Owner, params: &Params) -> Result<MetricItem> {
        let path = format!("{}/metrics.json", owner_path(owner));
        self.send(Method::POST, &path, params, "metric").await
    }

    async fn update_metric(&self, owner: Owner, id: i64, params: &Params) -> Result<MetricItem> {
        let path = format!("{}/metrics/{}.json", owner_path(owner), id);
        self.send(Method::PUT, &path, params, "metric").await
    }

    async fn delete_metric(&self, owner: Owner, id: i64) -> Result<()> {
        self.delete(&format!("{}/metrics/{}.json", owner_path(owner), id))
            .await
    }

    async fn list_mapping_rules(&self, owner: Owner) -> Result<Vec<MappingRuleItem>> {
        let path = format!("{}.json", mapping_rules_path(owner));
        self.get_list(&path, "mapping_rules", "mapping_rule").await
    }

    async fn create_mapping_rule(&self, owner: Owner, params: &Params) -> Result<MappingRuleItem> {
        let path = format!("{}.json", mapping_rules_path(owner));
        self.send(Method::POST, &path, params, "mapping_rule").await
    }

    async fn update_mapping_rule(
        &self,
        owner: Owner,
        id: i64,
        params: &Params,
    ) -> Result<MappingRuleItem> {
        let path = format!("{}/{}.json", mapping_rules_path(owner), id);
        self.send(Method::PATCH, &path, params, "mapping_rule").await
    }

    async fn delete_mapping_rule(&self, owner: Owner, id: i64) -> Result<()> {
        self.delete(&format!("{}/{}.json", mapping_rules_path(owner), id))
            .await
    }

    async fn list_plans(&self, product_id: i64) -> Result<Vec<PlanItem>> {
        let path = format!("/admin/api/services/{}/application_plans.json", product_id);
        self.get_list(&path, "plans", "application_plan").await
    }

    async fn create_plan(&self, product_id: i64, params: &Params) -> Result<PlanItem> {
        let path = format!("/admin/api/services/{}/application_plans.json", product_id);
        self.send(Method::POST, &path, params, "application_plan").await
    }

    async fn update_plan(&self, product_id: i64, id: i64, params: &Params) -> Result<PlanItem> {
        let path = format!(
            "/admin/api/services/{}/application_plans/{}.json",
            product_id, id
        );
        self.send(Method::PUT, &path, params, "application_plan").await
    }

    async fn delete_plan(&self, product_id: i64, id: i64) -> Result<()> {
        self.delete(&format!(
            "/admin/api/services/{}/application_plans/{}.json",
            product_id, id
        ))
        .await
    }

    async fn set_default_plan(&self, product_id: i64, id: i64) -> Result<PlanItem> {
        let path = format!(
            "/admin/api/services/{}/application_plans/{}/default.json",
            product_id, id
        );
        self.send(Method::PUT, &path, &Params::new(), "application_plan")
            .await
    }

    async fn list_limits(&self, plan_id: i64) -> Result<Vec<LimitItem>> {
        let path = format!("/admin/api/application_plans/{}/limits.json", plan_id);
        self.get_list(&path, "limits", "limit").await
    }

    async fn create_limit(
        &self,
        plan_id: i64,
        metric_id: i64,
        params: &Params,
    ) -> Result<LimitItem> {
        let path = format!(
            "/admin/api/application_plans/{}/metrics/{}/limits.json",
            plan_id, metric_id
        );
        self.send(Method::POST, &path, params, "limit").await
    }

    async fn update_limit(
        &self,
        plan_id: i64,
        metric_id: i64,
        id: i64,
        params: &Params,
    ) -> Result<LimitItem> {
        let path = format!(
            "/admin/api/application_plans/{}/metrics/{}/limits/{}.json",
            plan_id, metric_id, id
        );
        self.send(Method::PUT, &path, params, "limit").await
    }

    async fn delete_limit(&self, plan_id: i64, metric_id: i64, id: i64) -> Result<()> {
        self.delete(&format!(
            "/admin/api/application_plans/{}/metrics/{}/limits/{}.json",
            plan_id, metric_id, id
        ))
        .await
    }

    async fn list_pricing_rules(&self, plan_id: i64) -> Result<Vec<PricingRuleItem>> {
        let path = format!("/admin/api/application_plans/{}/pricing_rules.json", plan_id);
        self.get_list(&path, "pricing_rules", "pricing_rule").await
    }

    async fn create_pricing_rule(
        &self,
        plan_id: i64,
        metric_id: i64,
        params: &Params,
    ) -> Result<PricingRuleItem> {
        let path = format!(
            "/admin/api/application_plans/{}/metrics/{}/pricing_rules.json",
            plan_id, metric_id
        );
        self.send(Method::POST, &path, params, "pricing_rule").await
    }

    async fn delete_pricing_rule(&self, plan_id: i64, metric_id: i64, id: i64) -> Result<()> {
        self.delete(&format!(
            "/admin/api/application_plans/{}/metrics/{}/pricing_rules/{}.json",
            plan_id, metric_id, id
        ))
        .await
    }

    async fn list_backend_usages(&self, product_id: i64) -> Result<Vec<BackendUsageItem>> {
        let path = format!("/admin/api/services/{}/backend_usages.json", product_id);
        self.get_list(&path, "backend_usages", "backend_usage").await
    }

    async fn create_backend_usage(
        &self,
        product_id: i64,
        params: &Params,
    ) -> Result<BackendUsageItem> {
        let path = format!("/admin/api/services/{}/backend_usages.json", product_id);
        self.send(Method::POST, &path, params, "backend_usage").await
    }

    async fn update_backend_usage(
        &self,
        product_id: i64,
        id: i64,
        params: &Params,
    ) -> Result<BackendUsageItem> {
        let path = format!(
            "/admin/api/services/{}/backend_usages/{}.json",
            product_id, id
        );
        self.send(Method::PUT, &path, params, "backend_usage").await
    }

    async fn delete_backend_usage(&self, product_id: i64, id: i64) -> Result<()> {
        self.delete(&format!(
            "/admin/api/services/{}/backend_usages/{}.json",
            product_id, id
        ))
        .await
    }
}
