//! Reconcile flow shared by resources mirrored into the admin system
//!
//! One pass applies defaults, validates, synchronizes every entity kind,
//! classifies the outcome once and derives both the status and the retry
//! decision from that single classification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use crate::adapters::provider_account;
use crate::clock::Clock;
use crate::cluster::ClusterStore;
use crate::config::OperatorConfig;
use crate::crd::{Backend, LocalObjectReference, Product};
use crate::error::{Error, Result, SyncError};
use crate::events::{actions, reasons, EventPublisher};
use crate::metrics;
use crate::remote::{GatewayFactory, ProviderAccount, RemoteAdminGateway};

use super::status::{build_status, write_status, HasSyncStatus, Observed, StatusWrite};
use super::{backend, product, validation};

/// A resource whose spec is synchronized into the admin system
#[async_trait]
pub trait SyncedResource: HasSyncStatus {
    /// Fill in spec defaults; true when the spec changed
    fn apply_defaults(&mut self) -> bool;

    fn validate(&self) -> Result<()>;

    fn provider_account_ref(&self) -> Option<&LocalObjectReference>;

    /// Run every sync task against the admin system
    async fn sync_remote(&self, gateway: Arc<dyn RemoteAdminGateway>) -> (Observed, Result<()>);

    /// Remove the remote counterpart
    async fn delete_remote(&self, gateway: &dyn RemoteAdminGateway) -> Result<()>;
}

#[async_trait]
impl SyncedResource for Backend {
    fn apply_defaults(&mut self) -> bool {
        validation::set_backend_defaults(&mut self.spec)
    }

    fn validate(&self) -> Result<()> {
        validation::validate_backend(&self.spec)
    }

    fn provider_account_ref(&self) -> Option<&LocalObjectReference> {
        self.spec.provider_account_ref.as_ref()
    }

    async fn sync_remote(&self, gateway: Arc<dyn RemoteAdminGateway>) -> (Observed, Result<()>) {
        let (remote, result) = backend::sync(gateway, &self.spec).await;
        let observed = Observed {
            remote_id: remote.map(|b| b.id),
            ..Default::default()
        };
        (observed, result)
    }

    async fn delete_remote(&self, gateway: &dyn RemoteAdminGateway) -> Result<()> {
        let remote_id = self.status.as_ref().and_then(|s| s.remote_id);
        backend::delete(gateway, &self.spec, remote_id).await
    }
}

#[async_trait]
impl SyncedResource for Product {
    fn apply_defaults(&mut self) -> bool {
        validation::set_product_defaults(&mut self.spec)
    }

    fn validate(&self) -> Result<()> {
        validation::validate_product(&self.spec)
    }

    fn provider_account_ref(&self) -> Option<&LocalObjectReference> {
        self.spec.provider_account_ref.as_ref()
    }

    async fn sync_remote(&self, gateway: Arc<dyn RemoteAdminGateway>) -> (Observed, Result<()>) {
        let (remote, result) = product::sync(gateway, &self.spec).await;
        let observed = match remote {
            Some(p) => Observed {
                remote_id: Some(p.id),
                state: p.state,
                ..Default::default()
            },
            None => Observed::default(),
        };
        (observed, result)
    }

    async fn delete_remote(&self, gateway: &dyn RemoteAdminGateway) -> Result<()> {
        let remote_id = self.status.as_ref().and_then(|s| s.remote_id);
        product::delete(gateway, &self.spec, remote_id).await
    }
}

/// Collaborators of one reconcile pass
pub struct SyncDeps<'a, K> {
    pub resources: &'a dyn ClusterStore<K>,
    pub secrets: &'a dyn ClusterStore<Secret>,
    pub gateways: &'a dyn GatewayFactory,
    pub events: &'a dyn EventPublisher,
    pub clock: &'a dyn Clock,
    pub config: &'a OperatorConfig,
}

/// What the controller should do after a pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Synchronized, or invalid until the spec changes
    Done,
    Requeue(Duration),
    /// Orphan or transient failure, retried with backoff
    Retry(SyncError),
}

fn outcome_label(sync_error: Option<&SyncError>) -> &'static str {
    match sync_error {
        None => "synced",
        Some(SyncError::Invalid(_)) => "invalid",
        Some(SyncError::Orphan(_)) => "orphan",
        Some(SyncError::Transient(_)) => "transient",
        Some(SyncError::Wait { .. }) => "wait",
    }
}

async fn connect<K: SyncedResource>(
    obj: &K,
    deps: &SyncDeps<'_, K>,
) -> Result<(ProviderAccount, Arc<dyn RemoteAdminGateway>)> {
    let namespace = obj.namespace().unwrap_or_default();
    let account = provider_account(
        deps.secrets,
        &namespace,
        obj.provider_account_ref(),
        &deps.config.default_provider_account_secret,
    )
    .await?;
    let gateway = deps.gateways.gateway(&account)?;
    Ok((account, gateway))
}

/// One reconcile pass of a synchronized resource
pub async fn reconcile<K: SyncedResource>(obj: &K, deps: &SyncDeps<'_, K>) -> Result<Decision> {
    let kind = K::kind(&()).to_string();
    let namespace = obj.namespace().unwrap_or_default();

    let mut defaulted = obj.clone();
    if defaulted.apply_defaults() {
        info!(kind = %kind, name = %obj.name_any(), "Spec defaults applied");
        return match deps.resources.update(&namespace, &defaulted).await {
            Ok(_) | Err(Error::Conflict(_)) => Ok(Decision::Requeue(Duration::ZERO)),
            Err(e) => Err(e),
        };
    }

    let (observed, result) = match obj.validate() {
        Err(e) => (Observed::default(), Err(e)),
        Ok(()) => match connect(obj, deps).await {
            Err(e) => (Observed::default(), Err(e)),
            Ok((account, gateway)) => {
                let (mut observed, result) = obj.sync_remote(gateway).await;
                observed.provider_account_host = Some(account.host());
                (observed, result)
            }
        },
    };

    let sync_error = result.err().map(|e| {
        warn!(kind = %kind, name = %obj.name_any(), error = %e, "Synchronization failed");
        e.classify()
    });
    metrics::SYNC_OUTCOMES
        .with_label_values(&[kind.as_str(), outcome_label(sync_error.as_ref())])
        .inc();

    let status = build_status(obj.sync_status(), &observed, sync_error.as_ref(), deps.clock.now());
    let write = write_status(deps.resources, obj, status).await?;
    if write == StatusWrite::Conflict {
        return Ok(Decision::Requeue(Duration::ZERO));
    }

    Ok(match sync_error {
        None => Decision::Done,
        Some(SyncError::Invalid(message)) => {
            if write == StatusWrite::Written {
                deps.events
                    .publish(
                        &obj.object_ref(&()),
                        EventType::Warning,
                        reasons::INVALID_SPEC,
                        actions::SYNC,
                        Some(message),
                    )
                    .await;
            }
            Decision::Done
        }
        Some(SyncError::Wait { retry_after, .. }) => Decision::Requeue(retry_after),
        Some(other) => Decision::Retry(other),
    })
}

/// Remove the remote counterpart of a deleted resource
///
/// Without usable credentials there is nothing the operator can remove, so
/// the resource is released.
pub async fn cleanup<K: SyncedResource>(obj: &K, deps: &SyncDeps<'_, K>) -> Result<()> {
    let gateway = match connect(obj, deps).await {
        Ok((_, gateway)) => gateway,
        Err(e) => match e.classify() {
            SyncError::Invalid(message) | SyncError::Orphan(message) => {
                warn!(name = %obj.name_any(), error = %message, "Skipping remote cleanup");
                return Ok(());
            }
            _ => return Err(e),
        },
    };

    if let Err(e) = obj.delete_remote(gateway.as_ref()).await {
        deps.events
            .publish(
                &obj.object_ref(&()),
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                actions::CLEANUP,
                Some(e.to_string()),
            )
            .await;
        return Err(e);
    }
    Ok(())
}
