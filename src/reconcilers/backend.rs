//! Backend synchronization
//!
//! Tasks run in dependency order: the backend itself, then methods and
//! metrics, then the mapping rules that reference them.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::crd::BackendSpec;
use crate::diff::{track, TrackedEntity};
use crate::error::{Error, Result};
use crate::remote::{BackendApiItem, Owner, Params, RemoteAdminGateway};
use crate::tasks::TaskRunner;

use super::entities;
use super::validation::declared_names;

impl TrackedEntity<BackendApiItem> for BackendSpec {
    fn create_params(&self, key: &str) -> Params {
        let mut params = Params::from([
            ("system_name", key.to_string()),
            ("name", self.name.clone()),
            ("private_endpoint", self.private_base_url.clone()),
        ]);
        if !self.description.is_empty() {
            params.insert("description", self.description.clone());
        }
        params
    }

    fn changed_params(&self, existing: &BackendApiItem) -> Params {
        let mut params = Params::new();
        track(&mut params, "name", &self.name, &existing.name);
        track(&mut params, "private_endpoint", &self.private_base_url, &existing.private_endpoint);
        track(
            &mut params,
            "description",
            &self.description,
            &existing.description.clone().unwrap_or_default(),
        );
        params
    }
}

/// State shared by the backend sync tasks
pub struct BackendSync {
    pub spec: BackendSpec,
    pub gateway: Arc<dyn RemoteAdminGateway>,
    /// Remote backend, set by the first task
    pub remote: Option<BackendApiItem>,
}

impl BackendSync {
    pub fn new(spec: BackendSpec, gateway: Arc<dyn RemoteAdminGateway>) -> Self {
        Self {
            spec,
            gateway,
            remote: None,
        }
    }

    fn owner(&self) -> Result<Owner> {
        self.remote
            .as_ref()
            .map(|b| Owner::Backend(b.id))
            .ok_or_else(|| Error::Sync(format!("backend {} not registered", self.spec.system_name)))
    }
}

pub fn task_runner() -> TaskRunner<BackendSync> {
    let mut runner = TaskRunner::new("Backend");
    runner
        .add_task("SyncBackend", sync_backend)
        .add_task("SyncMethods", sync_methods)
        .add_task("SyncMetrics", sync_metrics)
        .add_task("SyncMappingRules", sync_mapping_rules);
    runner
}

fn sync_backend(ctx: &mut BackendSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let key = ctx.spec.system_name.clone();
        let existing = ctx
            .gateway
            .list_backends()
            .await?
            .into_iter()
            .find(|b| b.system_name == key);

        let backend = match existing {
            None => {
                let created = ctx.gateway.create_backend(&ctx.spec.create_params(&key)).await?;
                info!(system_name = %key, id = created.id, "Backend created");
                created
            }
            Some(current) => {
                let changes = ctx.spec.changed_params(&current);
                if changes.is_empty() {
                    current
                } else {
                    info!(system_name = %key, id = current.id, "Backend updated");
                    ctx.gateway.update_backend(current.id, &changes).await?
                }
            }
        };
        ctx.remote = Some(backend);
        Ok(())
    })
}

fn sync_methods(ctx: &mut BackendSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let owner = ctx.owner()?;
        entities::sync_methods(ctx.gateway.as_ref(), owner, &ctx.spec.methods).await?;
        Ok(())
    })
}

fn sync_metrics(ctx: &mut BackendSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let owner = ctx.owner()?;
        entities::sync_metrics(ctx.gateway.as_ref(), owner, &ctx.spec.metrics).await?;
        Ok(())
    })
}

fn sync_mapping_rules(ctx: &mut BackendSync) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let owner = ctx.owner()?;
        let declared = declared_names(&ctx.spec.metrics, &ctx.spec.methods);
        entities::sync_mapping_rules(ctx.gateway.as_ref(), owner, &ctx.spec.mapping_rules, &declared)
            .await?;
        Ok(())
    })
}

/// Run every backend task; the remote backend is returned even when a later task failed
pub async fn sync(
    gateway: Arc<dyn RemoteAdminGateway>,
    spec: &BackendSpec,
) -> (Option<BackendApiItem>, Result<()>) {
    let mut ctx = BackendSync::new(spec.clone(), gateway);
    let result = task_runner().run(&mut ctx).await;
    (ctx.remote, result)
}

/// Delete the remote backend; a backend already gone is not an error
pub async fn delete(
    gateway: &dyn RemoteAdminGateway,
    spec: &BackendSpec,
    remote_id: Option<i64>,
) -> Result<()> {
    let id = match remote_id {
        Some(id) => Some(id),
        None => gateway
            .list_backends()
            .await?
            .into_iter()
            .find(|b| b.system_name == spec.system_name)
            .map(|b| b.id),
    };

    let Some(id) = id else {
        return Ok(());
    };
    match gateway.delete_backend(id).await {
        Ok(()) => {
            info!(system_name = %spec.system_name, id, "Backend deleted");
            Ok(())
        }
        Err(e) if e.is_remote_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
