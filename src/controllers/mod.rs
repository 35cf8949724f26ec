//! Kubernetes controllers for the 3scale CRDs
//!
//! Each controller watches one kind and hands every event to the matching
//! reconciler in [`crate::reconcilers`].

mod backup_controller;
mod binding_controller;
mod restore_controller;
mod synced_controller;

pub use backup_controller::run as run_backup_controller;
pub use binding_controller::run as run_binding_controller;
pub use restore_controller::run as run_restore_controller;
pub use synced_controller::{run_backend_controller, run_product_controller};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kube::{runtime::controller::Action, Client, Resource, ResourceExt};
use tracing::error;

use crate::clock::{Clock, SystemClock};
use crate::cluster::KubeStore;
use crate::config::OperatorConfig;
use crate::error::{Error, SyncError};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::reconcilers::jobs::JobSettings;
use crate::remote::{GatewayFactory, PortaClientFactory};

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: OperatorConfig,
    pub gateways: Arc<dyn GatewayFactory>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventPublisher>,
    pub backoff: Backoff,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            events: KubeEventPublisher::shared(client.clone(), config.field_manager.clone()),
            client,
            config,
            gateways: Arc::new(PortaClientFactory::new()),
            clock: Arc::new(SystemClock),
            backoff: Backoff::default(),
        }
    }

    /// Cluster store for one kind
    pub fn store<K>(&self) -> KubeStore<K> {
        KubeStore::new(self.client.clone(), self.config.field_manager.clone())
    }

    /// Forget the failures of an object after a successful pass
    pub fn succeeded<K: Resource<DynamicType = ()>>(&self, obj: &K) {
        self.backoff.reset(&backoff_key(obj));
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            image: self.config.job_image.clone(),
            service_account: self.config.job_service_account.clone(),
        }
    }
}

/// Consecutive failures per object; each one doubles the retry delay
#[derive(Default)]
pub struct Backoff {
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&self, key: &str, base: Duration, max: Duration) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = base.saturating_mul(2u32.saturating_pow((*count).min(16))).min(max);
        *count += 1;
        delay
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

fn backoff_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Error policy shared by all controllers
///
/// Orphan and transient failures back off exponentially per object.
pub(crate) fn error_policy<K: Resource<DynamicType = ()>>(
    obj: Arc<K>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    let key = backoff_key(obj.as_ref());
    let max = ctx.config.max_backoff();
    match error.classify() {
        SyncError::Invalid(_) => Action::await_change(),
        SyncError::Orphan(_) => {
            Action::requeue(ctx.backoff.next_delay(&key, ctx.config.orphan_requeue(), max))
        }
        SyncError::Wait { retry_after, .. } => Action::requeue(retry_after),
        SyncError::Transient(_) => {
            Action::requeue(ctx.backoff.next_delay(&key, ctx.config.transient_requeue(), max))
        }
    }
}
