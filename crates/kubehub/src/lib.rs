//! Ephemera kubehub: kube client wiring, discovery-backed resource resolution and the dynamic
//! object calls the applier drives.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersionKind,
    Client, Config,
};
use tracing::info;

mod objects;
mod resolve;

pub use objects::{ClusterError, KubeObjects, ObjectClient};
pub use resolve::{
    discover, DiscoveredResource, DiscoveryResolver, DiscoverySnapshot, ResolveError, ResourceEndpoint,
    ResourceResolver, ResourceScope,
};

/// Build a kube client. An explicit kubeconfig path wins; otherwise the in-cluster service account
/// or the default kubeconfig is used.
pub async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            info!(path = %path.display(), cluster = %config.cluster_url, "kube client from kubeconfig");
            Ok(Client::try_from(config)?)
        }
        None => {
            let client = Client::try_default().await.context("inferring kube config")?;
            info!("kube client from inferred config");
            Ok(client)
        }
    }
}

/// Split an `apiVersion` into `(group, version)`; the core group is empty.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// `group/version/kind`, or `version/kind` for the core group.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}
