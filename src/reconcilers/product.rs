//! Product synchronization
//!
//! Registration, then methods and metrics, mapping rules, application plans
//! with their limits, and finally backend usages.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::crd::ProductSpec;
use crate::diff::{track, TrackedEntity};
use crate::error::{Error, Result};
use crate::remote::{Owner, Params, ProductItem, RemoteAdminGateway};
use crate::tasks::TaskRunner;

use super::entities;
use super::validation::declared_names;

impl TrackedEntity<ProductItem> for ProductSpec {
    fn create_params(&self, key: &str) -> Params {
        let mut params = Params::from([
            ("system_name", key.to_string()),
            ("name", self.name.clone()),
        ]);
        if !self.description.is_empty() {
            params.insert("description", self.description.clone());
        }
        if let Some(option) = self.deployment_option() {
            params.insert("deployment_option", option.to_string());
        }
        if let Some(version) = self.backend_version() {
            params.insert("backend_version", version.to_string());
        }
        params
    }

    fn changed_params(&self, existing: &ProductItem) -> Params {
        let mut params = Params::new();
        track(&mut params, "name", &self.name, &existing.name);
        track(
            &mut params,
            "description",
            &self.description,
            &existing.description.clone().unwrap_or_default(),
        );
        // Only managed when the spec sets them
        if let Some(option) = self.deployment_option() {
            if existing.deployment_option.as_deref() != Some(option) {
                params.insert("deployment_option", option.to_string());
            }
        }
        if let Some(version) = self.backend_version() {
            if existing.backend_version.as_deref() != Some(version) {
                params.insert("backend_version", version.to_string());
            }
        }
        params
    }
}

/// State shared by the product sync tasks
pub struct ProductSync {
    pub spec: ProductSpec,
    pub gateway: Arc<dyn RemoteAdminGateway>,
    pub remote: Option<ProductItem>,
}

impl ProductSync {
    pub fn new(spec: ProductSpec, gateway: Arc<dyn RemoteAdminGateway>) -> Self {
        Self {
            spec,
            gateway,
            remote: None,
        }
    }

    fn product_id(&self) -> Result<i64> {
        self.remote
            .as_ref()
            .map(|p| p.id)
            .ok_or_else(|| Error::Sync(format!("product {} not registered", self.spec.system_name)))
    }
}

pub fn task_runner() -> TaskRunner<ProductSync> {
    let mut runner = TaskRunner::new("Product");
    runner
        .add_task("SyncProduct", sync_product)
        .add_task("SyncMethods", sync_methods)
        .add_task("SyncMetrics", sync_metrics)
        .add_task("SyncMappingRules", sync_mapping_rules)
        .add_task("SyncApplicationPlans", sync_application_plans)
        .add_task("SyncBackendUsages", sync_backend_usages);
    runner
}

/// Find a product by system name
pub async fn find_product(
    gateway: &dyn RemoteAdminGateway,
    system_name: &str,
) -> Result<Option<ProductItem>> {
    Ok(gateway
        .list_products()
        .await?
        .into_iter()
        .find(|p| p.system_name == system_name))
}

/// Create or update the product itself
pub async fn register(gateway: &dyn RemoteAdminGateway, spec: &ProductSpec) -> Result<ProductItem> {
    let key = spec.system_name.as_str();
    match find_product(gateway, key).await? {
        None => {
            let created = gateway.create_product(&spec.create_params(key)).await?;
            info!(system_name = %key, id = created.id, "Product created");
            Ok(created)
        }
        Some(current) => {
            let changes = spec.changed_params(&current);
            if changes.is_empty() {
                Ok(current)
            } else {
                info!(system_name = %key, id = current.id, "Product updated");
                gateway.update_product(current.id, &changes).await
            }
        }
    }
}

fn sync_product(ctx: &mut ProductSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        ctx.remote = Some(register(ctx.gateway.as_ref(), &ctx.spec).await?);
        Ok(())
    })
}

fn sync_methods(ctx: &mut ProductSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let owner = Owner::Product(ctx.product_id()?);
        entities::sync_methods(ctx.gateway.as_ref(), owner, &ctx.spec.methods).await?;
        Ok(())
    })
}

fn sync_metrics(ctx: &mut ProductSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let owner = Owner::Product(ctx.product_id()?);
        entities::sync_metrics(ctx.gateway.as_ref(), owner, &ctx.spec.metrics).await?;
        Ok(())
    })
}

fn sync_mapping_rules(ctx: &mut ProductSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let owner = Owner::Product(ctx.product_id()?);
        let declared = declared_names(&ctx.spec.metrics, &ctx.spec.methods);
        entities::sync_mapping_rules(ctx.gateway.as_ref(), owner, &ctx.spec.mapping_rules, &declared)
            .await?;
        Ok(())
    })
}

fn sync_application_plans(ctx: &mut ProductSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let id = ctx.product_id()?;
        entities::sync_plans(ctx.gateway.as_ref(), id, &ctx.spec.application_plans).await?;
        Ok(())
    })
}

fn sync_backend_usages(ctx: &mut ProductSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let id = ctx.product_id()?;
        entities::sync_backend_usages(ctx.gateway.as_ref(), id, &ctx.spec.backend_usages).await?;
        Ok(())
    })
}

/// Run every product task; the remote product is returned even when a later task failed
pub async fn sync(
    gateway: Arc<dyn RemoteAdminGateway>,
    spec: &ProductSpec,
) -> (Option<ProductItem>, Result<()>) {
    let mut ctx = ProductSync::new(spec.clone(), gateway);
    let result = task_runner().run(&mut ctx).await;
    (ctx.remote, result)
}

/// Delete the remote product; a product already gone is not an error
pub async fn delete(
    gateway: &dyn RemoteAdminGateway,
    spec: &ProductSpec,
    remote_id: Option<i64>,
) -> Result<()> {
    let id = match remote_id {
        Some(id) => Some(id),
        None => find_product(gateway, &spec.system_name).await?.map(|p| p.id),
    };

    let Some(id) = id else {
        return Ok(());
    };
    match gateway.delete_product(id).await {
        Ok(()) => {
            info!(system_name = %spec.system_name, id, "Product deleted");
            Ok(())
        }
        Err(e) if e.is_remote_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
