//! Backend and Product controllers
//!
//! Both kinds share one reconcile flow; only the finalizer and the metric
//! label differ.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info, instrument};

use crate::cluster::KubeStore;
use crate::controllers::{error_policy, Context};
use crate::crd::{Backend, Product};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::resource::{self, Decision, SyncDeps, SyncedResource};

const BACKEND_FINALIZER: &str = "capabilities.3scale.net/backend-finalizer";
const PRODUCT_FINALIZER: &str = "capabilities.3scale.net/product-finalizer";

/// Synchronized kinds served from namespaced API endpoints
pub trait ControlledResource:
    SyncedResource + Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Debug
{
}

impl<K> ControlledResource for K where
    K: SyncedResource
        + Resource<Scope = NamespaceResourceScope>
        + DeserializeOwned
        + Serialize
        + Debug
{
}

/// Run the Backend controller
pub async fn run_backend_controller(client: Client, context: Arc<Context>) {
    run::<Backend>(client, context, BACKEND_FINALIZER).await
}

/// Run the Product controller
pub async fn run_product_controller(client: Client, context: Arc<Context>) {
    run::<Product>(client, context, PRODUCT_FINALIZER).await
}

async fn run<K: ControlledResource>(
    client: Client,
    context: Arc<Context>,
    finalizer_name: &'static str,
) {
    let kind = K::kind(&()).to_string();
    let api: Api<K> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("{} CRD not installed: {}", kind, e);
        return;
    }

    info!("Starting {} controller", kind);

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            move |obj, ctx| reconcile(obj, ctx, finalizer_name),
            error_policy,
            context,
        )
        .for_each(|result| {
            let kind = kind.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        info!(
                            name = %obj.name,
                            namespace = obj.namespace.as_deref().unwrap_or("default"),
                            "Reconciled {}", kind
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Reconciliation error");
                        metrics::RECONCILIATION_ERRORS.with_label_values(&[kind.as_str()]).inc();
                    }
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx, finalizer_name), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile<K: ControlledResource>(
    obj: Arc<K>,
    ctx: Arc<Context>,
    finalizer_name: &'static str,
) -> Result<Action> {
    let kind = K::kind(&()).to_string();
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[kind.as_str()])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[kind.as_str()]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    // Use finalizer so the remote counterpart is removed with the resource
    finalizer(&api, finalizer_name, obj, |event| async {
        match event {
            FinalizerEvent::Apply(obj) => apply(obj, ctx.clone()).await,
            FinalizerEvent::Cleanup(obj) => cleanup(obj, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Apply reconciliation (create/update)
async fn apply<K: ControlledResource>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let resources: KubeStore<K> = ctx.store();
    let secrets: KubeStore<Secret> = ctx.store();
    let deps = SyncDeps {
        resources: &resources,
        secrets: &secrets,
        gateways: ctx.gateways.as_ref(),
        events: ctx.events.as_ref(),
        clock: ctx.clock.as_ref(),
        config: &ctx.config,
    };

    info!(generation = obj.meta().generation.unwrap_or(0), "Reconciling {}", K::kind(&()));

    // Orphan and transient outcomes go back to the error policy for backoff
    let action = match resource::reconcile(obj.as_ref(), &deps).await? {
        Decision::Done => Action::await_change(),
        Decision::Requeue(after) => Action::requeue(after),
        Decision::Retry(outcome) => return Err(Error::Unsynced(outcome)),
    };
    ctx.succeeded(obj.as_ref());
    Ok(action)
}

/// Cleanup when resource is being deleted
async fn cleanup<K: ControlledResource>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    info!(name = %obj.name_any(), "Cleaning up {}", K::kind(&()));

    let resources: KubeStore<K> = ctx.store();
    let secrets: KubeStore<Secret> = ctx.store();
    let deps = SyncDeps {
        resources: &resources,
        secrets: &secrets,
        gateways: ctx.gateways.as_ref(),
        events: ctx.events.as_ref(),
        clock: ctx.clock.as_ref(),
        config: &ctx.config,
    };
    resource::cleanup(obj.as_ref(), &deps).await?;
    ctx.succeeded(obj.as_ref());

    metrics::CLEANUPS.with_label_values(&[K::kind(&()).as_ref()]).inc();
    Ok(Action::await_change())
}
