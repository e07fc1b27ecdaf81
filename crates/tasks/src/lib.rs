//! Ephemera task sources: where task templates (`<task>.yml`) are read from.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use ephemera_core::{EngineError, EngineResult};
use metrics::counter;
use tracing::{debug, warn};

/// Returns the raw template text for a task name.
#[async_trait::async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch(&self, task: &str) -> EngineResult<String>;
}

/// Object / file name holding the template of `task`.
pub fn object_key(task: &str) -> String { format!("{}.yml", task) }

/// Task names are plain identifiers; anything that could walk a path is treated as unknown.
fn check_task_name(task: &str) -> EngineResult<()> {
    if task.is_empty() || task.contains('/') || task.contains('\\') || task.contains("..") {
        return Err(EngineError::TemplateNotFound(task.to_string()));
    }
    Ok(())
}

/// Connection settings for an S3-compatible store (MinIO by default).
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// e.g. `http://minio:9000`
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

/// Templates stored as `<task>.yml` objects in one bucket.
pub struct S3TemplateSource {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3TemplateSource {
    pub fn new(settings: S3Settings) -> Self {
        let creds = Credentials::new(settings.access_key, settings.secret_key, None, None, "ephemera");
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region))
            .endpoint_url(settings.endpoint)
            .credentials_provider(creds)
            .force_path_style(true)
            .build();
        Self { client: aws_sdk_s3::Client::from_conf(conf), bucket: settings.bucket }
    }
}

#[async_trait::async_trait]
impl TemplateSource for S3TemplateSource {
    async fn fetch(&self, task: &str) -> EngineResult<String> {
        check_task_name(task)?;
        let key = object_key(task);
        let out = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(out) => out,
            Err(e) => {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    return Err(EngineError::TemplateNotFound(task.to_string()));
                }
                counter!("template_fetch_err", 1u64);
                let message = DisplayErrorContext(&e).to_string();
                warn!(bucket = %self.bucket, key = %key, error = %message, "template fetch failed");
                return Err(EngineError::TemplateFetch { task: task.to_string(), message });
            }
        };
        let bytes = out
            .body
            .collect()
            .await
            .map_err(|e| EngineError::TemplateFetch { task: task.to_string(), message: e.to_string() })?
            .into_bytes();
        debug!(bucket = %self.bucket, key = %key, bytes = bytes.len(), "template fetched");
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EngineError::TemplateFetch { task: task.to_string(), message: format!("not UTF-8: {}", e) })
    }
}

/// Templates stored as `<dir>/<task>.yml` files.
pub struct DirTemplateSource {
    dir: PathBuf,
}

impl DirTemplateSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }
}

#[async_trait::async_trait]
impl TemplateSource for DirTemplateSource {
    async fn fetch(&self, task: &str) -> EngineResult<String> {
        check_task_name(task)?;
        let path = self.dir.join(object_key(task));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::TemplateNotFound(task.to_string())),
            Err(e) => Err(EngineError::TemplateFetch { task: task.to_string(), message: format!("{}: {}", path.display(), e) }),
        }
    }
}

/// Fixed set of templates held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticTemplates {
    templates: HashMap<String, String>,
}

impl StaticTemplates {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, task: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(task.into(), template.into());
        self
    }
}

#[async_trait::async_trait]
impl TemplateSource for StaticTemplates {
    async fn fetch(&self, task: &str) -> EngineResult<String> {
        self.templates
            .get(task)
            .cloned()
            .ok_or_else(|| EngineError::TemplateNotFound(task.to_string()))
    }
}
