//! Status conditions of synchronized resources
//!
//! One classified sync outcome drives the four conditions. The computed
//! status is compared with the persisted one and written only when it differs.

use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::cluster::ClusterStore;
use crate::crd::common::{CONDITION_FAILED, CONDITION_INVALID, CONDITION_ORPHAN, CONDITION_SYNCED};
use crate::crd::{Backend, Condition, Conditions, Product, SyncStatus};
use crate::error::{Error, Result, SyncError};
use crate::metrics;

/// Resource carrying a [`SyncStatus`]
pub trait HasSyncStatus: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    fn sync_status(&self) -> Option<&SyncStatus>;
    fn set_sync_status(&mut self, status: SyncStatus);
}

impl HasSyncStatus for Backend {
    fn sync_status(&self) -> Option<&SyncStatus> {
        self.status.as_ref()
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.status = Some(status);
    }
}

impl HasSyncStatus for Product {
    fn sync_status(&self) -> Option<&SyncStatus> {
        self.status.as_ref()
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.status = Some(status);
    }
}

/// Remote facts learned during one sync pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observed {
    pub remote_id: Option<i64>,
    pub state: Option<String>,
    pub provider_account_host: Option<String>,
}

/// Derive the four conditions and merge them into `current`
///
/// Conditions of other types are kept untouched.
pub fn calculate(
    current: &Conditions,
    sync_error: Option<&SyncError>,
    ready: bool,
    now: DateTime<Utc>,
) -> Conditions {
    let invalid = matches!(sync_error, Some(SyncError::Invalid(_)));
    let orphan = matches!(sync_error, Some(SyncError::Orphan(_)));
    let failed = matches!(
        sync_error,
        Some(SyncError::Invalid(_) | SyncError::Orphan(_) | SyncError::Transient(_))
    );
    let synced = sync_error.is_none() && ready;
    let message = sync_error.map(|e| e.message().to_string());

    let mut conditions = current.clone();
    conditions.set_condition(Condition::new(CONDITION_SYNCED, synced, now));
    conditions.set_condition(
        Condition::new(CONDITION_INVALID, invalid, now).with_message(message.clone().filter(|_| invalid)),
    );
    conditions.set_condition(
        Condition::new(CONDITION_ORPHAN, orphan, now).with_message(message.clone().filter(|_| orphan)),
    );
    conditions.set_condition(
        Condition::new(CONDITION_FAILED, failed, now).with_message(message.filter(|_| failed)),
    );
    conditions
}

/// Compute the full status from the persisted one and this pass's outcome
///
/// Remote facts not observed in this pass keep their persisted value.
pub fn build_status(
    persisted: Option<&SyncStatus>,
    observed: &Observed,
    sync_error: Option<&SyncError>,
    now: DateTime<Utc>,
) -> SyncStatus {
    let mut status = persisted.cloned().unwrap_or_default();

    if observed.remote_id.is_some() {
        status.remote_id = observed.remote_id;
    }
    if observed.state.is_some() {
        status.state = observed.state.clone();
    }
    if observed.provider_account_host.is_some() {
        status.provider_account_host = observed.provider_account_host.clone();
    }

    status.error_message = match sync_error {
        Some(SyncError::Invalid(message)) => Some(message.clone()),
        _ => None,
    };
    status.conditions = calculate(&status.conditions, sync_error, sync_error.is_none(), now);
    status
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusWrite {
    /// Persisted status already matched
    Unchanged,
    Written,
    /// Stale resource version; the caller requeues
    Conflict,
}

/// Persist `desired` unless the resource already carries it for its current generation
pub async fn write_status<K: HasSyncStatus>(
    store: &dyn ClusterStore<K>,
    obj: &K,
    mut desired: SyncStatus,
) -> Result<StatusWrite> {
    let kind = K::kind(&()).to_string();
    desired.observed_generation = obj.meta().generation;

    if obj.sync_status() == Some(&desired) {
        debug!(kind = %kind, name = %obj.name_any(), "Status unchanged");
        return Ok(StatusWrite::Unchanged);
    }

    let namespace = obj.namespace().unwrap_or_default();
    let mut updated = obj.clone();
    updated.set_sync_status(desired);

    match store.update_status(&namespace, &updated).await {
        Ok(_) => {
            metrics::STATUS_WRITES.with_label_values(&[kind.as_str()]).inc();
            info!(kind = %kind, name = %obj.name_any(), "Status updated");
            Ok(StatusWrite::Written)
        }
        Err(Error::Conflict(what)) => {
            debug!(kind = %kind, conflict = %what, "Status write conflicted");
            Ok(StatusWrite::Conflict)
        }
        Err(e) => Err(e),
    }
}
