//! Binding controller
//!
//! Watches Binding resources and pushes the Api resources they select into
//! the admin portal. Remote drift is picked up by a periodic resync.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        watcher::Config as WatcherConfig,
    },
    Api, Client, Resource, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::cluster::KubeStore;
use crate::controllers::{error_policy, Context};
use crate::crd::Binding;
use crate::error::{Result, SyncError};
use crate::events::{actions, reasons};
use crate::metrics;
use crate::reconcilers::binding::{self as binding_reconciler, BindingContext};

const KIND: &str = "Binding";

/// Run the Binding controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<Binding> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Binding CRD not installed: {}", e);
        return;
    }

    info!("Starting Binding controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled Binding"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Binding>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let reference = obj.object_ref(&());

    let secrets: KubeStore<Secret> = ctx.store();
    let result = async {
        let account = binding_reconciler::binding_account(obj.as_ref(), &secrets).await?;
        let mut binding_ctx = BindingContext {
            binding: obj.as_ref().clone(),
            namespace,
            apis: Arc::new(ctx.store()),
            bindings: Arc::new(ctx.store()),
            gateway: ctx.gateways.gateway(&account)?,
            clock: ctx.clock.clone(),
        };
        binding_reconciler::reconcile(&mut binding_ctx).await
    }
    .await;

    match result {
        Ok(outcome) => {
            ctx.succeeded(obj.as_ref());
            if !outcome.applied.is_empty() {
                info!(
                    created = outcome.applied.create.len(),
                    updated = outcome.applied.update.len(),
                    deleted = outcome.applied.delete.len(),
                    "Binding applied"
                );
            }
            Ok(Action::requeue(ctx.config.binding_resync()))
        }
        Err(e) => match e.classify() {
            SyncError::Invalid(message) => {
                warn!(error = %message, "Binding cannot be applied");
                ctx.events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::INVALID_SPEC,
                        actions::SYNC,
                        Some(message),
                    )
                    .await;
                Ok(Action::await_change())
            }
            _ => Err(e),
        },
    }
}
