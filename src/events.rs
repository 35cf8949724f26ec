//! Kubernetes Events for user-visible reconcile outcomes

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use kube::{
    api::{Api, PostParams},
    Client,
};
use kube_runtime::events::EventType;
use tracing::warn;

pub mod reasons {
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const ORPHAN_SPEC: &str = "OrphanSpec";
    pub const SYNC_FAILED: &str = "SyncFailed";
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
    pub const PIPELINE_FAILED: &str = "PipelineFailed";
    pub const COMPLETED: &str = "Completed";
}

pub mod actions {
    pub const SYNC: &str = "Sync";
    pub const CLEANUP: &str = "Cleanup";
    pub const BACKUP: &str = "Backup";
    pub const RESTORE: &str = "Restore";
}

/// Publishes events; failures are logged, never returned
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Creates core/v1 Events through the API server
pub struct KubeEventPublisher {
    client: Client,
    component: String,
}

impl KubeEventPublisher {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }

    pub fn shared(client: Client, component: impl Into<String>) -> Arc<dyn EventPublisher> {
        Arc::new(Self::new(client, component))
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let namespace = object.namespace.clone().unwrap_or_else(|| "default".to_string());
        let now = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!(
                    "{}-",
                    object.name.as_deref().unwrap_or("threescale")
                )),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: object.clone(),
            type_: Some(
                match type_ {
                    EventType::Normal => "Normal",
                    EventType::Warning => "Warning",
                }
                .to_string(),
            ),
            reason: Some(reason.to_string()),
            action: Some(action.to_string()),
            message: note,
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            count: Some(1),
            reporting_component: Some(self.component.clone()),
            reporting_instance: Some(self.component.clone()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = api.create(&PostParams::default(), &event).await {
            warn!(reason, error = %e, "Failed to publish event");
        }
    }
}

/// Discards every event
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _object: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}
