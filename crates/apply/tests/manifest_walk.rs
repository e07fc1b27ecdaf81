#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ephemera_apply::{DeletePolicy, ManifestApplier, ManifestLimits};
use ephemera_core::EngineError;
use ephemera_kubehub::{
    gvk_key, ClusterError, DiscoveredResource, DiscoverySnapshot, ObjectClient, ResolveError, ResourceEndpoint,
    ResourceResolver,
};
use kube::core::{DynamicObject, GroupVersionKind};

struct TableResolver(DiscoverySnapshot);

#[async_trait::async_trait]
impl ResourceResolver for TableResolver {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceEndpoint, ResolveError> {
        self.0.find(gvk).ok_or_else(|| ResolveError::NotFound(gvk_key(gvk)))
    }
}

fn res(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> DiscoveredResource {
    DiscoveredResource { group: group.into(), version: version.into(), kind: kind.into(), plural: plural.into(), namespaced }
}

fn resolver() -> Arc<TableResolver> {
    Arc::new(TableResolver(DiscoverySnapshot::new(vec![
        res("", "v1", "Pod", "pods", true),
        res("", "v1", "Service", "services", true),
        res("", "v1", "ConfigMap", "configmaps", true),
        res("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
    ])))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Create { plural: String, namespace: Option<String>, name: String },
    Delete { plural: String, namespace: Option<String>, name: String },
}

#[derive(Default)]
struct RecordingObjects {
    calls: Mutex<Vec<Call>>,
    /// plural/name -> error returned instead of performing the call
    failures: Mutex<HashMap<String, ClusterError>>,
}

impl RecordingObjects {
    fn fail(&self, plural: &str, name: &str, err: ClusterError) {
        self.failures.lock().unwrap().insert(format!("{}/{}", plural, name), err);
    }

    fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    fn check(&self, plural: &str, name: &str) -> Result<(), ClusterError> {
        match self.failures.lock().unwrap().get(&format!("{}/{}", plural, name)) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ObjectClient for RecordingObjects {
    async fn create(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.check(&ep.resource.plural, &name)?;
        self.calls.lock().unwrap().push(Call::Create {
            plural: ep.resource.plural.clone(),
            namespace: namespace.map(str::to_string),
            name,
        });
        Ok(obj.clone())
    }

    async fn delete(&self, ep: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        self.check(&ep.resource.plural, name)?;
        self.calls.lock().unwrap().push(Call::Delete {
            plural: ep.resource.plural.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn list(&self, _ep: &ResourceEndpoint, _ns: Option<&str>, _sel: &str) -> Result<Vec<DynamicObject>, ClusterError> {
        Ok(Vec::new())
    }
}

fn applier() -> (ManifestApplier, Arc<RecordingObjects>) {
    let objects = Arc::new(RecordingObjects::default());
    (ManifestApplier::new(resolver(), objects.clone(), "ctf"), objects)
}

fn create(plural: &str, ns: Option<&str>, name: &str) -> Call {
    Call::Create { plural: plural.into(), namespace: ns.map(str::to_string), name: name.into() }
}

fn delete(plural: &str, ns: Option<&str>, name: &str) -> Call {
    Call::Delete { plural: plural.into(), namespace: ns.map(str::to_string), name: name.into() }
}

const POD_SVC: &str = "\
apiVersion: v1
kind: Pod
metadata:
  name: scan-alice
  labels:
    app: scan-alice
    client: alice
spec:
  containers:
    - name: scan
      image: registry.local/scan:latest
---
apiVersion: v1
kind: Service
metadata:
  name: scan-alice
spec:
  selector:
    app: scan-alice
";

#[tokio::test]
async fn apply_creates_documents_in_order() {
    let (applier, objects) = applier();
    let created = applier.apply(POD_SVC).await.unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].gvk, "v1/Pod");
    assert_eq!(objects.calls(), vec![create("pods", Some("ctf"), "scan-alice"), create("services", Some("ctf"), "scan-alice")]);
}

#[tokio::test]
async fn unknown_kind_stops_the_walk_without_rollback() {
    let (applier, objects) = applier();
    let manifest = "\
apiVersion: v1
kind: ConfigMap
metadata: { name: a }
---
apiVersion: example.com/v1
kind: Bogus
metadata: { name: b }
---
apiVersion: v1
kind: ConfigMap
metadata: { name: c }
";
    let err = applier.apply(manifest).await.unwrap_err();
    assert_eq!(err, EngineError::Resolution { document: 1, gvk: "example.com/v1/Bogus".into() });
    assert_eq!(objects.calls(), vec![create("configmaps", Some("ctf"), "a")]);
}

#[tokio::test]
async fn namespace_defaulting_follows_scope() {
    let (applier, objects) = applier();
    let manifest = "\
apiVersion: v1
kind: Pod
metadata: { name: p1 }
---
apiVersion: v1
kind: Pod
metadata: { name: p2, namespace: '' }
---
apiVersion: v1
kind: Pod
metadata: { name: p3, namespace: other }
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata: { name: reader, namespace: ignored }
";
    let created = applier.apply(manifest).await.unwrap();
    assert_eq!(
        objects.calls(),
        vec![
            create("pods", Some("ctf"), "p1"),
            create("pods", Some("ctf"), "p2"),
            create("pods", Some("other"), "p3"),
            create("clusterroles", None, "reader"),
        ]
    );
    assert_eq!(created[3].namespace, None);
}

#[tokio::test]
async fn create_conflict_is_surfaced_with_code() {
    let (applier, objects) = applier();
    objects.fail("pods", "scan-alice", ClusterError::new(Some(409), "pods \"scan-alice\" already exists"));
    let err = applier.apply(POD_SVC).await.unwrap_err();
    match &err {
        EngineError::Apply { document, code, target, .. } => {
            assert_eq!(*document, 0);
            assert_eq!(*code, Some(409));
            assert_eq!(target, "v1/Pod ctf/scan-alice");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(err.cluster_code(), Some(409));
    assert!(objects.calls().is_empty());
}

#[tokio::test]
async fn decode_error_mid_stream_is_fatal_after_earlier_documents() {
    let (applier, objects) = applier();
    let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata: { name: a }\n---\nkind: [broken\n";
    let err = applier.apply(manifest).await.unwrap_err();
    assert!(matches!(err, EngineError::Decode { document: 1, .. }), "err={:?}", err);
    assert_eq!(objects.calls(), vec![create("configmaps", Some("ctf"), "a")]);
}

#[tokio::test]
async fn missing_kind_is_a_decode_error() {
    let (applier, objects) = applier();
    let err = applier.apply("apiVersion: v1\nmetadata: { name: a }\n").await.unwrap_err();
    assert_eq!(err, EngineError::Decode { document: 0, message: "missing kind".into() });
    assert!(objects.calls().is_empty());
}

#[tokio::test]
async fn empty_documents_are_skipped() {
    let (applier, objects) = applier();
    let manifest = "---\napiVersion: v1\nkind: ConfigMap\nmetadata: { name: a }\n---\n";
    applier.apply(manifest).await.unwrap();
    assert_eq!(objects.calls(), vec![create("configmaps", Some("ctf"), "a")]);
}

#[tokio::test]
async fn json_stream_manifests_are_accepted() {
    let (applier, objects) = applier();
    let manifest = r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}}
{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"b","namespace":"x"}}"#;
    applier.apply(manifest).await.unwrap();
    assert_eq!(objects.calls(), vec![create("configmaps", Some("ctf"), "a"), create("configmaps", Some("x"), "b")]);
}

#[tokio::test]
async fn oversized_manifest_is_rejected_before_any_call() {
    let objects = Arc::new(RecordingObjects::default());
    let applier = ManifestApplier::new(resolver(), objects.clone(), "ctf")
        .with_limits(ManifestLimits { max_bytes: 16, max_nodes: 100 });
    let err = applier.apply(POD_SVC).await.unwrap_err();
    assert!(matches!(err, EngineError::Decode { document: 0, .. }));
    assert!(objects.calls().is_empty());
}

#[tokio::test]
async fn delete_uses_metadata_name_in_order() {
    let (applier, objects) = applier();
    let deleted = applier.delete(POD_SVC, DeletePolicy::Strict).await.unwrap();
    assert_eq!(deleted.len(), 2);
    assert_eq!(objects.calls(), vec![delete("pods", Some("ctf"), "scan-alice"), delete("services", Some("ctf"), "scan-alice")]);
}

#[tokio::test]
async fn delete_without_name_fails() {
    let (applier, objects) = applier();
    let err = applier
        .delete("apiVersion: v1\nkind: ConfigMap\nmetadata: { generateName: a- }\n", DeletePolicy::Strict)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Decode { document: 0, message: "missing metadata.name".into() });
    assert!(objects.calls().is_empty());
}

#[tokio::test]
async fn strict_delete_fails_on_missing_object() {
    let (applier, objects) = applier();
    objects.fail("pods", "scan-alice", ClusterError::new(Some(404), "not found"));
    let err = applier.delete(POD_SVC, DeletePolicy::Strict).await.unwrap_err();
    assert!(matches!(err, EngineError::Delete { document: 0, code: Some(404), .. }), "err={:?}", err);
    assert!(objects.calls().is_empty());
}

#[tokio::test]
async fn tolerant_delete_skips_missing_objects() {
    let (applier, objects) = applier();
    objects.fail("pods", "scan-alice", ClusterError::new(Some(404), "not found"));
    let deleted = applier.delete(POD_SVC, DeletePolicy::TolerateMissing).await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(objects.calls(), vec![delete("services", Some("ctf"), "scan-alice")]);
}

#[tokio::test]
async fn tolerant_delete_still_fails_on_other_errors() {
    let (applier, objects) = applier();
    objects.fail("pods", "scan-alice", ClusterError::new(Some(403), "forbidden"));
    let err = applier.delete(POD_SVC, DeletePolicy::TolerateMissing).await.unwrap_err();
    assert_eq!(err.cluster_code(), Some(403));
    assert!(objects.calls().is_empty());
}

#[tokio::test]
async fn node_budget_rejects_a_document_before_its_create() {
    let objects = Arc::new(RecordingObjects::default());
    let applier = ManifestApplier::new(resolver(), objects.clone(), "ctf")
        .with_limits(ManifestLimits { max_bytes: 1 << 20, max_nodes: 8 });
    // 5 nodes, then 10 nodes
    let manifest = "\
apiVersion: v1
kind: ConfigMap
metadata: { name: a }
---
apiVersion: v1
kind: ConfigMap
metadata: { name: b }
data: { k1: '1', k2: '2', k3: '3', k4: '4' }
";
    let err = applier.apply(manifest).await.unwrap_err();
    assert!(matches!(&err, EngineError::Decode { document: 1, message } if message.contains("too complex")), "err={:?}", err);
    assert_eq!(objects.calls(), vec![create("configmaps", Some("ctf"), "a")]);
}

#[tokio::test]
async fn node_budget_allows_a_document_at_the_limit() {
    let objects = Arc::new(RecordingObjects::default());
    let applier = ManifestApplier::new(resolver(), objects.clone(), "ctf")
        .with_limits(ManifestLimits { max_bytes: 1 << 20, max_nodes: 8 });
    // root, apiVersion, kind, metadata, name, data, k1, k2
    let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata: { name: a }\ndata: { k1: '1', k2: '2' }\n";
    applier.apply(manifest).await.unwrap();
    assert_eq!(objects.calls(), vec![create("configmaps", Some("ctf"), "a")]);
}

#[tokio::test]
async fn unterminated_yaml_fails_once_and_returns() {
    let (applier, objects) = applier();
    let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata: { name: a }\n---\nmetadata: [unclosed\n---\napiVersion: v1\nkind: ConfigMap\nmetadata: { name: c }\n";
    let err = applier.delete(manifest, DeletePolicy::TolerateMissing).await.unwrap_err();
    assert!(matches!(err, EngineError::Decode { document: 1, .. }), "err={:?}", err);
    assert_eq!(objects.calls(), vec![delete("configmaps", Some("ctf"), "a")]);
}

fn spawnable<F: std::future::Future + Send>(f: F) -> F { f }

#[tokio::test]
async fn apply_and_delete_futures_can_cross_threads() {
    let (applier, _objects) = applier();
    let applier = Arc::new(applier);
    let a = Arc::clone(&applier);
    let created = tokio::spawn(async move { a.apply(POD_SVC).await }).await.unwrap().unwrap();
    assert_eq!(created.len(), 2);
    spawnable(applier.delete(POD_SVC, DeletePolicy::Strict)).await.unwrap();
}
