//! Access to the 3scale admin API
//!
//! [`RemoteAdminGateway`] is the boundary every reconciler talks to. A missing
//! remote object is always reported as [`Error::RemoteNotFound`](crate::Error::RemoteNotFound).

mod model;
mod porta;

pub use model::*;
pub use porta::PortaClient;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait RemoteAdminGateway: Send + Sync {
    async fn list_backends(&self) -> Result<Vec<BackendApiItem>>;
    async fn create_backend(&self, params: &Params) -> Result<BackendApiItem>;
    async fn update_backend(&self, id: i64, params: &Params) -> Result<BackendApiItem>;
    async fn delete_backend(&self, id: i64) -> Result<()>;

    async fn list_products(&self) -> Result<Vec<ProductItem>>;
    async fn create_product(&self, params: &Params) -> Result<ProductItem>;
    async fn update_product(&self, id: i64, params: &Params) -> Result<ProductItem>;
    async fn delete_product(&self, id: i64) -> Result<()>;

    async fn list_methods(&self, owner: Owner) -> Result<Vec<MethodItem>>;
    async fn create_method(&self, owner: Owner, params: &Params) -> Result<MethodItem>;
    async fn update_method(&self, owner: Owner, id: i64, params: &Params) -> Result<MethodItem>;
    async fn delete_method(&self, owner: Owner, id: i64) -> Result<()>;

    /// Top-level metrics only; methods are excluded
    async fn list_metrics(&self, owner: Owner) -> Result<Vec<MetricItem>>;
    async fn create_metric(&self, owner: Owner, params: &Params) -> Result<MetricItem>;
    async fn update_metric(&self, owner: Owner, id: i64, params: &Params) -> Result<MetricItem>;
    async fn delete_metric(&self, owner: Owner, id: i64) -> Result<()>;

    async fn list_mapping_rules(&self, owner: Owner) -> Result<Vec<MappingRuleItem>>;
    async fn create_mapping_rule(&self, owner: Owner, params: &Params) -> Result<MappingRuleItem>;
    async fn update_mapping_rule(
        &self,
        owner: Owner,
        id: i64,
        params: &Params,
    ) -> Result<MappingRuleItem>;
    async fn delete_mapping_rule(&self, owner: Owner, id: i64) -> Result<()>;

    async fn list_plans(&self, product_id: i64) -> Result<Vec<PlanItem>>;
    async fn create_plan(&self, product_id: i64, params: &Params) -> Result<PlanItem>;
    async fn update_plan(&self, product_id: i64, id: i64, params: &Params) -> Result<PlanItem>;
    async fn delete_plan(&self, product_id: i64, id: i64) -> Result<()>;
    async fn set_default_plan(&self, product_id: i64, id: i64) -> Result<PlanItem>;

    async fn list_limits(&self, plan_id: i64) -> Result<Vec<LimitItem>>;
    async fn create_limit(&self, plan_id: i64, metric_id: i64, params: &Params)
        -> Result<LimitItem>;
    async fn update_limit(
        &self,
        plan_id: i64,
        metric_id: i64,
        id: i64,
        params: &Params,
    ) -> Result<LimitItem>;
    async fn delete_limit(&self, plan_id: i64, metric_id: i64, id: i64) -> Result<()>;

    /// Pricing rules cannot be updated in place; a changed rule is deleted and recreated
    async fn list_pricing_rules(&self, plan_id: i64) -> Result<Vec<PricingRuleItem>>;
    async fn create_pricing_rule(
        &self,
        plan_id: i64,
        metric_id: i64,
        params: &Params,
    ) -> Result<PricingRuleItem>;
    async fn delete_pricing_rule(&self, plan_id: i64, metric_id: i64, id: i64) -> Result<()>;

    async fn list_backend_usages(&self, product_id: i64) -> Result<Vec<BackendUsageItem>>;
    async fn create_backend_usage(
        &self,
        product_id: i64,
        params: &Params,
    ) -> Result<BackendUsageItem>;
    async fn update_backend_usage(
        &self,
        product_id: i64,
        id: i64,
        params: &Params,
    ) -> Result<BackendUsageItem>;
    async fn delete_backend_usage(&self, product_id: i64, id: i64) -> Result<()>;
}

/// Credentials of one admin account
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderAccount {
    pub admin_url: String,
    pub token: String,
}

impl ProviderAccount {
    /// Host part of the admin URL, recorded in resource status
    pub fn host(&self) -> String {
        self.admin_url
            .split("://")
            .last()
            .unwrap_or_default()
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

impl std::fmt::Debug for ProviderAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAccount")
            .field("admin_url", &self.admin_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Builds a gateway for a provider account
pub trait GatewayFactory: Send + Sync {
    fn gateway(&self, account: &ProviderAccount) -> Result<Arc<dyn RemoteAdminGateway>>;
}

/// Factory producing HTTP clients against the admin API
#[derive(Clone, Default)]
pub struct PortaClientFactory {
    http: reqwest::Client,
}

impl PortaClientFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GatewayFactory for PortaClientFactory {
    fn gateway(&self, account: &ProviderAccount) -> Result<Arc<dyn RemoteAdminGateway>> {
        Ok(Arc::new(PortaClient::with_http_client(
            self.http.clone(),
            account,
        )?))
    }
}
