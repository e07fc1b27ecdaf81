//! Dynamic create/delete/list against resolved endpoints.

use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::DynamicObject,
    Client,
};
use tracing::debug;

use crate::resolve::ResourceEndpoint;

const FIELD_MANAGER: &str = "ephemera";

/// A cluster API failure, keeping the HTTP status code when the API server answered with one.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ClusterError {
    pub code: Option<u16>,
    pub message: String,
}

impl ClusterError {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn is_not_found(&self) -> bool { self.code == Some(404) }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => Self { code: Some(resp.code), message: resp.message },
            other => Self { code: None, message: other.to_string() },
        }
    }
}

/// Verbs the engine needs from the cluster. `namespace` is ignored for cluster-scoped endpoints.
#[async_trait::async_trait]
pub trait ObjectClient: Send + Sync {
    async fn create(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    async fn delete(&self, endpoint: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> Result<(), ClusterError>;

    async fn list(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError>;
}

/// `ObjectClient` over `kube::Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeObjects {
    client: Client,
}

impl KubeObjects {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, endpoint: &ResourceEndpoint, namespace: Option<&str>) -> Api<DynamicObject> {
        match (endpoint.namespaced(), namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &endpoint.resource),
            _ => Api::all_with(self.client.clone(), &endpoint.resource),
        }
    }
}

#[async_trait::async_trait]
impl ObjectClient for KubeObjects {
    async fn create(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let created = self.api(endpoint, namespace).create(&pp, obj).await?;
        debug!(plural = %endpoint.resource.plural, ns = ?namespace, "created");
        Ok(created)
    }

    async fn delete(&self, endpoint: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        self.api(endpoint, namespace).delete(name, &DeleteParams::background()).await?;
        debug!(plural = %endpoint.resource.plural, ns = ?namespace, name, "deleted");
        Ok(())
    }

    async fn list(
        &self,
        endpoint: &ResourceEndpoint,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let lp = ListParams::default().labels(label_selector);
        let list = self.api(endpoint, namespace).list(&lp).await?;
        Ok(list.items)
    }
}
