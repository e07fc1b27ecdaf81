//! Resource type resolution against live API discovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gvk_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceScope {
    Namespaced,
    Cluster,
}

/// Concrete endpoint for a kind: the pluralized resource plus its scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEndpoint {
    pub resource: ApiResource,
    pub scope: ResourceScope,
}

impl ResourceEndpoint {
    pub fn namespaced(&self) -> bool { self.scope == ResourceScope::Namespaced }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no resource registered for {0}")]
    NotFound(String),
    #[error("discovery failed: {0}")]
    Discovery(String),
}

/// Maps a kind/version onto a queryable endpoint. Implementations must not rely on a compiled-in
/// type catalog.
#[async_trait::async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceEndpoint, ResolveError>;
}

/// One served resource as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        gvk_key(&GroupVersionKind::gvk(&self.group, &self.version, &self.kind))
    }

    pub fn endpoint(&self) -> ResourceEndpoint {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        ResourceEndpoint {
            resource: ApiResource {
                group: self.group.clone(),
                version: self.version.clone(),
                api_version,
                kind: self.kind.clone(),
                plural: self.plural.clone(),
            },
            scope: if self.namespaced { ResourceScope::Namespaced } else { ResourceScope::Cluster },
        }
    }
}

/// Discover every served resource in every served version (incl. CRDs).
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>, kube::Error> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for version in group.versions() {
            for (ar, caps) in group.versioned_resources(version) {
                out.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// A discovery result and when it was taken.
#[derive(Debug, Clone)]
pub struct DiscoverySnapshot {
    pub fetched_at: Instant,
    pub resources: Vec<DiscoveredResource>,
}

impl DiscoverySnapshot {
    pub fn new(resources: Vec<DiscoveredResource>) -> Self {
        Self { fetched_at: Instant::now(), resources }
    }

    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        !ttl.is_zero() && now.saturating_duration_since(self.fetched_at) < ttl
    }

    pub fn find(&self, gvk: &GroupVersionKind) -> Option<ResourceEndpoint> {
        self.resources
            .iter()
            .find(|r| r.group == gvk.group && r.version == gvk.version && r.kind == gvk.kind)
            .map(DiscoveredResource::endpoint)
    }
}

/// Resolver backed by kube discovery. With a zero TTL every call refetches discovery; a non-zero
/// TTL reuses the last snapshot until it ages out. Misses are never retried against a fresh
/// snapshot.
pub struct DiscoveryResolver {
    client: Client,
    ttl: Duration,
    snapshot: ArcSwapOption<DiscoverySnapshot>,
}

impl DiscoveryResolver {
    pub fn new(client: Client, ttl: Duration) -> Self {
        Self { client, ttl, snapshot: ArcSwapOption::empty() }
    }

    async fn current(&self) -> Result<Arc<DiscoverySnapshot>, ResolveError> {
        if let Some(snap) = self.snapshot.load_full() {
            if snap.is_fresh(self.ttl, Instant::now()) {
                return Ok(snap);
            }
        }
        let resources = discover(self.client.clone()).await.map_err(|e| {
            counter!("discovery_err", 1u64);
            ResolveError::Discovery(e.to_string())
        })?;
        debug!(resources = resources.len(), "discovery refreshed");
        let snap = Arc::new(DiscoverySnapshot::new(resources));
        if !self.ttl.is_zero() {
            self.snapshot.store(Some(Arc::clone(&snap)));
        }
        Ok(snap)
    }
}

#[async_trait::async_trait]
impl ResourceResolver for DiscoveryResolver {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceEndpoint, ResolveError> {
        let snap = self.current().await?;
        snap.find(gvk).ok_or_else(|| ResolveError::NotFound(gvk_key(gvk)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> DiscoveredResource {
        DiscoveredResource {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced,
        }
    }

    fn snapshot() -> DiscoverySnapshot {
        DiscoverySnapshot::new(vec![
            res("", "v1", "Pod", "pods", true),
            res("", "v1", "Namespace", "namespaces", false),
            res("apps", "v1", "Deployment", "deployments", true),
            res("autoscaling", "v1", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
            res("autoscaling", "v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
            res("ctf.example.com", "v1alpha1", "Challenge", "challenges", true),
        ])
    }

    #[test]
    fn finds_core_kind_with_plural_and_scope() {
        let ep = snapshot().find(&GroupVersionKind::gvk("", "v1", "Pod")).unwrap();
        assert_eq!(ep.resource.plural, "pods");
        assert_eq!(ep.resource.api_version, "v1");
        assert!(ep.namespaced());
    }

    #[test]
    fn finds_cluster_scoped_kind() {
        let ep = snapshot().find(&GroupVersionKind::gvk("", "v1", "Namespace")).unwrap();
        assert_eq!(ep.scope, ResourceScope::Cluster);
    }

    #[test]
    fn finds_non_preferred_version_and_crds() {
        let s = snapshot();
        let hpa = s.find(&GroupVersionKind::gvk("autoscaling", "v1", "HorizontalPodAutoscaler")).unwrap();
        assert_eq!(hpa.resource.api_version, "autoscaling/v1");
        let crd = s.find(&GroupVersionKind::gvk("ctf.example.com", "v1alpha1", "Challenge")).unwrap();
        assert_eq!(crd.resource.plural, "challenges");
    }

    #[test]
    fn misses_on_wrong_version_or_kind() {
        let s = snapshot();
        assert!(s.find(&GroupVersionKind::gvk("apps", "v1beta1", "Deployment")).is_none());
        assert!(s.find(&GroupVersionKind::gvk("", "v1", "Poddd")).is_none());
        // group must match too
        assert!(s.find(&GroupVersionKind::gvk("apps", "v1", "Pod")).is_none());
    }

    #[test]
    fn discovered_key_matches_gvk_key() {
        assert_eq!(res("", "v1", "Pod", "pods", true).gvk_key(), "v1/Pod");
        assert_eq!(res("apps", "v1", "Deployment", "deployments", true).gvk_key(), "apps/v1/Deployment");
    }

    #[test]
    fn zero_ttl_is_never_fresh() {
        let s = snapshot();
        assert!(!s.is_fresh(Duration::ZERO, s.fetched_at));
        assert!(s.is_fresh(Duration::from_secs(30), s.fetched_at + Duration::from_secs(29)));
        assert!(!s.is_fresh(Duration::from_secs(30), s.fetched_at + Duration::from_secs(30)));
    }
}
