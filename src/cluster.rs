//! Namespaced object store over the Kubernetes API
//!
//! Reconcilers talk to the cluster through [`ClusterStore`] so they can be
//! exercised against an in-memory store in tests.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait ClusterStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects of a namespace, optionally filtered by a label selector
    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>>;

    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace an object; fails with [`Error::Conflict`] on a stale resource version
    async fn update(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Write the status sub-object; fails with [`Error::Conflict`] on a stale resource version
    async fn update_status(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterStore`] backed by the API server
pub struct KubeStore<K> {
    client: Client,
    field_manager: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            _kind: PhantomData,
        }
    }
}

fn is_status(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == code)
}

fn write_error(e: kube::Error, kind: &str, name: &str) -> Error {
    if is_status(&e, 409) {
        Error::Conflict(format!("{} {}", kind, name))
    } else {
        Error::Kube(e)
    }
}

#[async_trait]
impl<K> ClusterStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.filter(|s| !s.is_empty()) {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let created = api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| write_error(e, &K::kind(&()), &obj.name_any()))?;
        debug!(kind = %K::kind(&()), name = %obj.name_any(), "Created object");
        Ok(created)
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = obj.name_any();
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| write_error(e, &K::kind(&()), &name))
    }

    async fn update_status(&self, namespace: &str, obj: &K) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = obj.name_any();
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        // resourceVersion in a merge patch makes the server reject stale writes
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        api.patch_status(&name, &PatchParams::apply(&self.field_manager), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error(e, &K::kind(&()), &name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
