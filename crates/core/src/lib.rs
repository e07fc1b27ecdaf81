//! Ephemera core types: render variables, instance keys, object references and the engine error
//! taxonomy shared by every layer.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod render;

pub use render::render;

/// Variables substituted into a task template. Serialized field names are the placeholder names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderVars {
    pub client: String,
    pub flag: String,
}

impl RenderVars {
    pub fn new(client: impl Into<String>, flag: impl Into<String>) -> Self {
        Self { client: client.into(), flag: flag.into() }
    }
}

/// Identity of one workload instance: `<task>-<client>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey(String);

impl InstanceKey {
    pub fn new(task: &str, client: &str) -> Self {
        Self(format!("{}-{}", task, client))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for InstanceKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Reference to one object touched while walking a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// `group/version/kind`, or `version/kind` for the core group.
    pub gvk: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

/// Errors surfaced by the lifecycle engine on the request path.
///
/// Cluster rejections keep the API status code (when the server sent one) so the control plane can
/// pass conflicts and not-founds through.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("fetching template {task}: {message}")]
    TemplateFetch { task: String, message: String },
    #[error("render: {0}")]
    Render(String),
    #[error("decode: document {document}: {message}")]
    Decode { document: usize, message: String },
    #[error("resolution: document {document}: no resource registered for {gvk}")]
    Resolution { document: usize, gvk: String },
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("apply: document {document} ({target}): {message}")]
    Apply { document: usize, target: String, code: Option<u16>, message: String },
    #[error("delete: document {document} ({target}): {message}")]
    Delete { document: usize, target: String, code: Option<u16>, message: String },
    #[error("query {selector}: {message}")]
    Query { selector: String, code: Option<u16>, message: String },
}

impl EngineError {
    /// HTTP status code the cluster API answered with, if this error came from it.
    pub fn cluster_code(&self) -> Option<u16> {
        match self {
            EngineError::Apply { code, .. } | EngineError::Delete { code, .. } | EngineError::Query { code, .. } => *code,
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

pub mod prelude {
    pub use super::{EngineError, EngineResult, InstanceKey, ObjectRef, RenderVars};
}
