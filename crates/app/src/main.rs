use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ephemera_api::WorkloadEngine;
use ephemera_apply::{DeletePolicy, ManifestApplier, ManifestLimits};
use ephemera_core::{render, ObjectRef, RenderVars};
use ephemera_kubehub::{kube_client, DiscoveryResolver, KubeObjects};
use ephemera_lifecycle::LifecycleRegistry;
use ephemera_server::AppState;
use ephemera_tasks::{DirTemplateSource, S3Settings, S3TemplateSource, TemplateSource};
use kube::Client;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ephemera", version, about = "On-demand workloads with automatic expiry")]
struct Cli {
    /// Output format for one-shot commands
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced objects that do not name one
    #[arg(long, env = "EPHEMERA_NAMESPACE", global = true, default_value = "default")]
    namespace: String,

    /// Kubeconfig file (default: in-cluster service account, then ~/.kube/config)
    #[arg(long, env = "KUBECONFIG_PATH", global = true)]
    kubeconfig: Option<PathBuf>,

    /// How long a discovery snapshot is reused; 0 re-discovers on every lookup
    #[arg(long, env = "EPHEMERA_DISCOVERY_TTL_SECS", global = true, default_value_t = 0)]
    discovery_ttl_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP control plane
    Serve(ServeArgs),
    /// Render a local template and create its objects (no expiry)
    Apply(ManifestArgs),
    /// Render a local template and delete its objects
    Delete(ManifestArgs),
    /// List served resources (incl. CRDs)
    Discover,
}

const MAX_LIFETIME_MINUTES: u64 = 365 * 24 * 60;

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "EPHEMERA_LISTEN", default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Expected `X-Service-Key` header value
    #[arg(long, env = "SRV_KEY", hide_env_values = true)]
    service_key: String,

    /// Workload lifetime in minutes (at most one year)
    #[arg(long, env = "LIFETIME", default_value_t = 1, value_parser = clap::value_parser!(u64).range(0..=MAX_LIFETIME_MINUTES))]
    lifetime_minutes: u64,

    /// Read templates from `<dir>/<task>.yml` instead of object storage
    #[arg(long, env = "EPHEMERA_TASKS_DIR")]
    tasks_dir: Option<PathBuf>,

    #[arg(long, env = "MINIO_HOST")]
    minio_host: Option<String>,

    #[arg(long, env = "MINIO_PORT", default_value_t = 9000)]
    minio_port: u16,

    #[arg(long, env = "MINIO_ACCESS_KEY", hide_env_values = true, default_value = "")]
    minio_access_key: String,

    #[arg(long, env = "MINIO_SECRET_KEY", hide_env_values = true, default_value = "")]
    minio_secret_key: String,

    #[arg(long, env = "EPHEMERA_BUCKET", default_value = "tasks")]
    bucket: String,
}

#[derive(Args, Debug)]
struct ManifestArgs {
    /// Template file
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Value for `{{client}}`
    #[arg(long)]
    client: String,

    /// Value for `{{flag}}`
    #[arg(long, default_value = "")]
    flag: String,
}

fn init_tracing() {
    let env = std::env::var("EPHEMERA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EPHEMERA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid EPHEMERA_METRICS_ADDR; expected host:port");
        }
    }
}

fn manifest_applier(cli: &Cli, client: Client) -> ManifestApplier {
    let resolver = Arc::new(DiscoveryResolver::new(client.clone(), Duration::from_secs(cli.discovery_ttl_secs)));
    ManifestApplier::new(resolver, Arc::new(KubeObjects::new(client)), cli.namespace.clone())
        .with_limits(ManifestLimits::from_env())
}

fn template_source(args: &ServeArgs) -> Result<Arc<dyn TemplateSource>> {
    if let Some(dir) = &args.tasks_dir {
        info!(dir = %dir.display(), "templates from directory");
        return Ok(Arc::new(DirTemplateSource::new(dir)));
    }
    let Some(host) = &args.minio_host else {
        bail!("either --tasks-dir or --minio-host is required");
    };
    let endpoint = format!("http://{}:{}", host, args.minio_port);
    info!(endpoint = %endpoint, bucket = %args.bucket, "templates from object storage");
    Ok(Arc::new(S3TemplateSource::new(S3Settings {
        endpoint,
        access_key: args.minio_access_key.clone(),
        secret_key: args.minio_secret_key.clone(),
        bucket: args.bucket.clone(),
        region: "us-east-1".into(),
    })))
}

fn lifetime_from_minutes(minutes: u64) -> Result<Duration> {
    let secs = minutes.checked_mul(60).context("lifetime overflows")?;
    Ok(Duration::from_secs(secs))
}

async fn serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    if args.service_key.is_empty() {
        bail!("--service-key / SRV_KEY must not be empty");
    }
    let client = kube_client(cli.kubeconfig.as_deref()).await?;
    let applier = Arc::new(manifest_applier(cli, client));
    let registry = Arc::new(LifecycleRegistry::new());
    let lifetime = lifetime_from_minutes(args.lifetime_minutes)?;
    let engine = WorkloadEngine::new(template_source(args)?, applier, Arc::clone(&registry), lifetime);

    let router = ephemera_server::router(AppState::new(Arc::new(engine), args.service_key.as_str()));
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(addr = %args.listen, namespace = %cli.namespace, lifetime_secs = lifetime.as_secs(), "listening");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "waiting for ctrl-c failed");
        }
        info!("shutdown requested");
    };
    ephemera_server::serve(listener, router, shutdown).await?;

    let pending = registry.armed_keys();
    if !pending.is_empty() {
        let keys: Vec<&str> = pending.iter().map(|k| k.as_str()).collect();
        warn!(count = registry.shutdown(), keys = ?keys, "pending expiries dropped; workloads stay until stopped");
    }
    Ok(())
}

async fn rendered(args: &ManifestArgs) -> Result<String> {
    let template = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    Ok(render(&template, &RenderVars::new(&args.client, &args.flag))?)
}

fn print_refs(output: Output, verb: &str, refs: &[ObjectRef]) -> Result<()> {
    match output {
        Output::Human => {
            for r in refs {
                println!("{} {}", verb, r);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(refs)?),
    }
    Ok(())
}

async fn one_shot(cli: &Cli, args: &ManifestArgs, delete: bool) -> Result<()> {
    let manifest = rendered(args).await?;
    let client = kube_client(cli.kubeconfig.as_deref()).await?;
    let applier = manifest_applier(cli, client);
    if delete {
        let refs = applier.delete(&manifest, DeletePolicy::Strict).await?;
        print_refs(cli.output, "deleted", &refs)
    } else {
        let refs = applier.apply(&manifest).await?;
        print_refs(cli.output, "created", &refs)
    }
}

async fn discover(cli: &Cli, kubeconfig: Option<&Path>) -> Result<()> {
    let client = kube_client(kubeconfig).await?;
    let resources = ephemera_kubehub::discover(client).await.context("discovery")?;
    match cli.output {
        Output::Human => {
            for r in resources {
                let scope = if r.namespaced { "namespaced" } else { "cluster" };
                println!("{} • {} • {}", r.gvk_key(), r.plural, scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve(args) => serve(&cli, args).await,
        Commands::Apply(args) => one_shot(&cli, args, false).await,
        Commands::Delete(args) => one_shot(&cli, args, true).await,
        Commands::Discover => discover(&cli, cli.kubeconfig.as_deref()).await,
    }
}
