//! Ephemera apply: walk a rendered multi-document manifest in order, resolve each document's
//! endpoint through discovery and create or delete it.
//!
//! Processing is fail-fast. The first decode, resolution or API failure stops the walk and is
//! returned; documents handled before it are left in place (no rollback).

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use ephemera_core::{EngineError, EngineResult, ObjectRef};
use ephemera_kubehub::{split_api_version, ClusterError, ObjectClient, ResolveError, ResourceEndpoint, ResourceResolver};
use kube::core::{DynamicObject, GroupVersionKind};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{info, warn};

mod decode;

pub use decode::ManifestLimits;
use decode::{documents, json_node_budget_exceeded};

/// How delete treats objects that are already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// A 404 from the API is an error (explicit stop).
    Strict,
    /// A 404 is logged and the walk continues (expiry cleanup).
    TolerateMissing,
}

/// One document made ready for a cluster call.
struct Target {
    endpoint: ResourceEndpoint,
    obj: DynamicObject,
    reference: ObjectRef,
}

impl Target {
    fn namespace(&self) -> Option<&str> { self.reference.namespace.as_deref() }
}

/// Applies and deletes manifests against whatever the resolver and object client point at.
pub struct ManifestApplier {
    resolver: Arc<dyn ResourceResolver>,
    objects: Arc<dyn ObjectClient>,
    namespace: String,
    limits: ManifestLimits,
}

impl ManifestApplier {
    /// `namespace` is used for namespaced documents that do not name one.
    pub fn new(resolver: Arc<dyn ResourceResolver>, objects: Arc<dyn ObjectClient>, namespace: impl Into<String>) -> Self {
        Self { resolver, objects, namespace: namespace.into(), limits: ManifestLimits::default() }
    }

    pub fn with_limits(mut self, limits: ManifestLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn resolver(&self) -> &Arc<dyn ResourceResolver> { &self.resolver }

    pub fn objects(&self) -> &Arc<dyn ObjectClient> { &self.objects }

    /// Create every document of `manifest`, in order.
    pub async fn apply(&self, manifest: &str) -> EngineResult<Vec<ObjectRef>> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        self.check_size(manifest)?;
        let mut created = Vec::new();
        for (document, doc) in documents(manifest).into_iter().enumerate() {
            let doc = doc.map_err(|message| EngineError::Decode { document, message })?;
            if doc.is_null() { continue; }
            let mut target = self.prepare(document, doc).await?;
            match self.objects.create(&target.endpoint, target.namespace(), &target.obj).await {
                Ok(obj) => {
                    // generateName objects only learn their name from the server
                    if let Some(name) = obj.metadata.name {
                        target.reference.name = name;
                    }
                    info!(object = %target.reference, "created");
                    created.push(target.reference);
                }
                Err(e) => {
                    counter!("apply_err", 1u64);
                    return Err(cluster_error(document, &target.reference, e, false));
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        Ok(created)
    }

    /// Delete every document of `manifest` by `metadata.name`, in order.
    pub async fn delete(&self, manifest: &str, policy: DeletePolicy) -> EngineResult<Vec<ObjectRef>> {
        let t0 = Instant::now();
        counter!("delete_attempts", 1u64);
        self.check_size(manifest)?;
        let mut deleted = Vec::new();
        for (document, doc) in documents(manifest).into_iter().enumerate() {
            let doc = doc.map_err(|message| EngineError::Decode { document, message })?;
            if doc.is_null() { continue; }
            let target = self.prepare(document, doc).await?;
            if target.obj.metadata.name.as_deref().unwrap_or("").is_empty() {
                return Err(EngineError::Decode { document, message: "missing metadata.name".into() });
            }
            match self.objects.delete(&target.endpoint, target.namespace(), &target.reference.name).await {
                Ok(()) => {
                    info!(object = %target.reference, "deleted");
                    deleted.push(target.reference);
                }
                Err(e) if policy == DeletePolicy::TolerateMissing && e.is_not_found() => {
                    warn!(object = %target.reference, "already gone; continuing");
                }
                Err(e) => {
                    counter!("delete_err", 1u64);
                    return Err(cluster_error(document, &target.reference, e, true));
                }
            }
        }
        histogram!("delete_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("delete_ok", 1u64);
        Ok(deleted)
    }

    fn check_size(&self, manifest: &str) -> EngineResult<()> {
        if manifest.len() > self.limits.max_bytes {
            return Err(EngineError::Decode {
                document: 0,
                message: format!("manifest too large (>{} bytes)", self.limits.max_bytes),
            });
        }
        Ok(())
    }

    async fn prepare(&self, document: usize, mut doc: Json) -> EngineResult<Target> {
        let decode_err = |message: String| EngineError::Decode { document, message };
        if json_node_budget_exceeded(&doc, self.limits.max_nodes) {
            return Err(decode_err(format!("document too complex (>{} nodes)", self.limits.max_nodes)));
        }
        let map = doc.as_object_mut().ok_or_else(|| decode_err("document is not a mapping".into()))?;
        let api_version = map
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| decode_err("missing apiVersion".into()))?
            .to_string();
        let kind = map
            .get("kind")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| decode_err("missing kind".into()))?
            .to_string();
        map.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        let mut obj: DynamicObject = serde_json::from_value(doc).map_err(|e| decode_err(e.to_string()))?;

        let (group, version) = split_api_version(&api_version);
        let gvk = GroupVersionKind { group, version, kind };
        let endpoint = self.resolver.resolve(&gvk).await.map_err(|e| match e {
            ResolveError::NotFound(gvk) => {
                counter!("resolve_miss", 1u64);
                EngineError::Resolution { document, gvk }
            }
            ResolveError::Discovery(message) => EngineError::Discovery(message),
        })?;

        if endpoint.namespaced() {
            if obj.metadata.namespace.as_deref().unwrap_or("").is_empty() {
                obj.metadata.namespace = Some(self.namespace.clone());
            }
        } else {
            obj.metadata.namespace = None;
        }

        let name = match (&obj.metadata.name, &obj.metadata.generate_name) {
            (Some(n), _) if !n.is_empty() => n.clone(),
            (_, Some(prefix)) => format!("{}*", prefix),
            _ => String::new(),
        };
        let reference = ObjectRef { gvk: ephemera_kubehub::gvk_key(&gvk), namespace: obj.metadata.namespace.clone(), name };
        Ok(Target { endpoint, obj, reference })
    }
}

fn cluster_error(document: usize, target: &ObjectRef, e: ClusterError, delete: bool) -> EngineError {
    warn!(document, object = %target, code = ?e.code, error = %e, op = if delete { "delete" } else { "create" }, "cluster call failed");
    let (target, code, message) = (target.to_string(), e.code, e.message);
    if delete {
        EngineError::Delete { document, target, code, message }
    } else {
        EngineError::Apply { document, target, code, message }
    }
}
