//! Ephemera workload façade.
//!
//! Composes template fetch, rendering, manifest apply/delete and the lifecycle registry into the
//! operations frontends (HTTP, CLI) depend on.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use ephemera_apply::{DeletePolicy, ManifestApplier};
use ephemera_core::{render, EngineError, EngineResult, InstanceKey, ObjectRef, RenderVars};
use ephemera_kubehub::{gvk_key, ClusterError, ResolveError};
use ephemera_lifecycle::LifecycleRegistry;
use ephemera_tasks::TemplateSource;
use kube::core::{DynamicObject, GroupVersionKind};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Snapshot of the pod backing a workload instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub name: String,
    pub phase: String,
    pub ip: String,
    /// `HH:MM`, UTC
    pub created_at: String,
}

impl WorkloadStatus {
    fn from_pod(pod: &DynamicObject) -> Self {
        let field = |ptr: &str| pod.data.pointer(ptr).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: field("/status/phase"),
            ip: field("/status/podIP"),
            created_at: pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.format("%H:%M").to_string())
                .unwrap_or_default(),
        }
    }
}

/// Operations exposed to the control plane.
#[async_trait::async_trait]
pub trait WorkloadControl: Send + Sync {
    /// Provision `task` for `client` with the default lifetime.
    async fn start(&self, task: &str, client: &str, flag: &str) -> EngineResult<()>;

    /// Tear down `task` for `client` now and disarm its expiry.
    async fn stop(&self, task: &str, client: &str, flag: &str) -> EngineResult<()>;

    /// Pod labelled `app=<task>-<client>`, if any.
    async fn status(&self, task: &str, client: &str) -> EngineResult<Option<WorkloadStatus>>;

    /// Pod for `client` (any task when `task` is `None`), if any.
    async fn active(&self, client: &str, task: Option<&str>) -> EngineResult<Option<WorkloadStatus>>;
}

/// In-process engine backed by a template source, a manifest applier and a lifecycle registry.
pub struct WorkloadEngine {
    templates: Arc<dyn TemplateSource>,
    applier: Arc<ManifestApplier>,
    registry: Arc<LifecycleRegistry>,
    lifetime: Duration,
}

impl WorkloadEngine {
    pub fn new(
        templates: Arc<dyn TemplateSource>,
        applier: Arc<ManifestApplier>,
        registry: Arc<LifecycleRegistry>,
        lifetime: Duration,
    ) -> Self {
        Self { templates, applier, registry, lifetime }
    }

    pub fn registry(&self) -> &Arc<LifecycleRegistry> { &self.registry }

    pub fn lifetime(&self) -> Duration { self.lifetime }

    async fn manifest(&self, task: &str, vars: &RenderVars) -> EngineResult<String> {
        let template = self.templates.fetch(task).await?;
        render(&template, vars)
    }

    /// Apply the task manifest and arm its expiry. Nothing is armed when apply fails; objects
    /// created before the failure stay.
    pub async fn start_for(&self, task: &str, client: &str, flag: &str, lifetime: Duration) -> EngineResult<Vec<ObjectRef>> {
        let vars = RenderVars::new(client, flag);
        let manifest = self.manifest(task, &vars).await?;
        let created = match self.applier.apply(&manifest).await {
            Ok(created) => created,
            Err(e) => {
                counter!("workload_start_err", 1u64);
                warn!(task, client, error = %e, "start failed");
                return Err(e);
            }
        };

        let key = InstanceKey::new(task, client);
        let applier = Arc::clone(&self.applier);
        self.registry.arm(key.clone(), lifetime, async move {
            applier.delete(&manifest, DeletePolicy::TolerateMissing).await.map(|_| ())
        });
        counter!("workload_started_total", 1u64);
        info!(key = %key, objects = created.len(), lifetime_secs = lifetime.as_secs(), "workload started");
        Ok(created)
    }

    /// Delete the task manifest, then disarm its expiry. A failed delete leaves the timer armed.
    pub async fn stop_now(&self, task: &str, client: &str, flag: &str) -> EngineResult<Vec<ObjectRef>> {
        let vars = RenderVars::new(client, flag);
        let manifest = self.manifest(task, &vars).await?;
        let key = InstanceKey::new(task, client);
        let deleted = match self.applier.delete(&manifest, DeletePolicy::Strict).await {
            Ok(deleted) => deleted,
            Err(e) => {
                counter!("workload_stop_err", 1u64);
                warn!(key = %key, error = %e, armed = self.registry.is_armed(&key), "stop failed");
                return Err(e);
            }
        };
        self.registry.cancel(&key);
        counter!("workload_stopped_total", 1u64);
        info!(key = %key, objects = deleted.len(), "workload stopped");
        Ok(deleted)
    }

    async fn first_pod(&self, selector: &str) -> EngineResult<Option<WorkloadStatus>> {
        let gvk = GroupVersionKind::gvk("", "v1", "Pod");
        let endpoint = self.applier.resolver().resolve(&gvk).await.map_err(|e| match e {
            ResolveError::NotFound(_) => EngineError::Resolution { document: 0, gvk: gvk_key(&gvk) },
            ResolveError::Discovery(message) => EngineError::Discovery(message),
        })?;
        let pods = self
            .applier
            .objects()
            .list(&endpoint, Some(self.applier.namespace()), selector)
            .await
            .map_err(|ClusterError { code, message }| EngineError::Query { selector: selector.to_string(), code, message })?;
        Ok(pods.first().map(WorkloadStatus::from_pod))
    }
}

fn app_selector(task: &str, client: &str) -> String { format!("app={}", InstanceKey::new(task, client)) }

#[async_trait::async_trait]
impl WorkloadControl for WorkloadEngine {
    async fn start(&self, task: &str, client: &str, flag: &str) -> EngineResult<()> {
        self.start_for(task, client, flag, self.lifetime).await.map(|_| ())
    }

    async fn stop(&self, task: &str, client: &str, flag: &str) -> EngineResult<()> {
        self.stop_now(task, client, flag).await.map(|_| ())
    }

    async fn status(&self, task: &str, client: &str) -> EngineResult<Option<WorkloadStatus>> {
        self.first_pod(&app_selector(task, client)).await
    }

    async fn active(&self, client: &str, task: Option<&str>) -> EngineResult<Option<WorkloadStatus>> {
        let selector = match task.filter(|t| !t.is_empty()) {
            Some(task) => app_selector(task, client),
            None => format!("client={}", client),
        };
        self.first_pod(&selector).await
    }
}
