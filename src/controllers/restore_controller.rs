//! APIManagerRestore controller
//!
//! Watches APIManagerRestore resources and the Jobs they own. Restores are
//! one-shot: once completed the resource is left alone.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
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

use crate::controllers::{error_policy, Context};
use crate::crd::APIManagerRestore;
use crate::error::{Result, SyncError};
use crate::events::{actions, reasons};
use crate::metrics;
use crate::reconcilers::restore::{self as restore_reconciler, RestoreContext};

const KIND: &str = "APIManagerRestore";

/// Run the APIManagerRestore controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<APIManagerRestore> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("APIManagerRestore CRD not installed: {}", e);
        return;
    }

    info!("Starting APIManagerRestore controller");

    Controller::new(api, WatcherConfig::default())
        .owns(Api::<Job>::all(client.clone()), WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled APIManagerRestore"
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
async fn reconcile(obj: Arc<APIManagerRestore>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let was_completed = obj.status.as_ref().and_then(|s| s.completed) == Some(true);

    let mut restore_ctx = RestoreContext {
        restore: obj.as_ref().clone(),
        namespace,
        api_managers: Arc::new(ctx.store()),
        restores: Arc::new(ctx.store()),
        jobs: Arc::new(ctx.store()),
        claims: Arc::new(ctx.store()),
        secrets: Arc::new(ctx.store()),
        clock: ctx.clock.clone(),
        settings: ctx.job_settings(),
        wait_requeue: ctx.config.wait_requeue(),
        to_restore: None,
    };

    let reference = obj.object_ref(&());
    match restore_reconciler::reconcile(&mut restore_ctx, ctx.config.pipeline_requeue()).await {
        Ok(Some(after)) => {
            ctx.succeeded(obj.as_ref());
            Ok(Action::requeue(after))
        }
        Ok(None) => {
            ctx.succeeded(obj.as_ref());
            if !was_completed && restore_ctx.status().completed == Some(true) {
                info!("Restore completed");
                ctx.events
                    .publish(&reference, EventType::Normal, reasons::COMPLETED, actions::RESTORE, None)
                    .await;
            }
            Ok(Action::await_change())
        }
        Err(e) => match e.classify() {
            SyncError::Invalid(message) => {
                warn!(error = %message, "Restore cannot proceed");
                ctx.events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::PIPELINE_FAILED,
                        actions::RESTORE,
                        Some(message),
                    )
                    .await;
                Ok(Action::await_change())
            }
            SyncError::Wait { message, retry_after } => {
                info!(reason = %message, "Restore waiting");
                Ok(Action::requeue(retry_after))
            }
            _ => Err(e),
        },
    }
}
