//! `flowyard` CLI: validate or run a wired artifact with the built-in
//! implementations.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use flowyard_runtime::service::{
    build_operation_pipeline, CallerOrigin, Operation, OperationError, OperationResponse,
    OperationRouter, OperationService,
};
use flowyard_runtime::{
    ImplementationCatalog, MemoryLoader, NotificationMode, RuntimeConfig, SchemeLoader,
    ServiceManager, TracingSink,
};
use serde_json::json;
use tower::{Service, ServiceExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flowyard", version, about = "Service and artifact lifecycle orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load an artifact, start it in dependency order, run, then remove it.
    Run {
        /// Descriptor locator (`file://...`, `mem://...`) or a file path.
        locator: String,
        /// Run for this many seconds instead of waiting for Ctrl+C.
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Resolve a descriptor and check its wiring without running it.
    Validate {
        /// Descriptor locator or a file path.
        locator: String,
    },
}

#[derive(Args, Debug)]
struct RuntimeArgs {
    #[arg(long, global = true, value_enum, env = "FLOWYARD_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[arg(long, global = true, env = "FLOWYARD_CHANNEL_CAPACITY", default_value_t = 32)]
    channel_capacity: usize,

    #[arg(long, global = true, env = "FLOWYARD_ENQUEUE_TIMEOUT_MS", default_value_t = 100)]
    enqueue_timeout_ms: u64,

    #[arg(long, global = true, env = "FLOWYARD_TEARDOWN_GRACE_MS", default_value_t = 5000)]
    teardown_grace_ms: u64,

    #[arg(long, global = true, value_enum, env = "FLOWYARD_NOTIFICATION_MODE", default_value = "async")]
    notification_mode: NotificationArg,

    #[arg(long, global = true, env = "FLOWYARD_NODE_ID", default_value = "local")]
    node_id: String,

    /// Serve Prometheus metrics on this address.
    #[arg(long, global = true, env = "FLOWYARD_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NotificationArg {
    Sync,
    Async,
}

impl RuntimeArgs {
    fn to_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            node_id: self.node_id.clone(),
            channel_capacity: self.channel_capacity,
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            teardown_grace: Duration::from_millis(self.teardown_grace_ms),
            notification_mode: match self.notification_mode {
                NotificationArg::Sync => NotificationMode::Sync,
                NotificationArg::Async => NotificationMode::Async,
            },
            ..RuntimeConfig::default()
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_env("FLOWYARD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Accepts URLs as-is and turns anything else into a `file://` URL.
fn to_locator(raw: &str) -> anyhow::Result<String> {
    if url::Url::parse(raw).is_ok() {
        return Ok(raw.to_string());
    }
    let path = std::fs::canonicalize(Path::new(raw))
        .with_context(|| format!("descriptor not found: {raw}"))?;
    url::Url::from_file_path(&path)
        .map(String::from)
        .map_err(|()| anyhow::anyhow!("not an absolute path: {}", path.display()))
}

async fn dispatch<S>(pipeline: &mut S, op: Operation) -> Result<OperationResponse, OperationError>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError>,
{
    pipeline.ready().await?.call(op).await
}

async fn wait_for_exit(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::select! {
            () = tokio::time::sleep(duration) => {}
            _ = tokio::signal::ctrl_c() => {}
        },
        None => {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(?err, "failed to install Ctrl+C handler");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.runtime.log_format);

    if let Some(addr) = cli.runtime.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let config = Arc::new(cli.runtime.to_config());
    let loader = Arc::new(SchemeLoader::standard(Arc::new(MemoryLoader::new())));
    let manager = Arc::new(ServiceManager::new(
        (*config).clone(),
        loader,
        Arc::new(ImplementationCatalog::with_builtins()),
        Arc::new(TracingSink),
    ));

    match cli.command {
        Command::Validate { locator } => {
            let locator = to_locator(&locator)?;
            let descriptor = manager.validate(&locator).await?;
            info!(
                name = %descriptor.name,
                services = descriptor.services.len(),
                relations = descriptor.relations.len(),
                "descriptor is valid"
            );
        }
        Command::Run {
            locator,
            duration_secs,
        } => {
            let locator = to_locator(&locator)?;
            let classifier = OperationService::new(config.clone());
            let mut pipeline =
                build_operation_pipeline(OperationRouter::for_manager(&manager), &config);

            let op = classifier.classify("addArtifact", &[json!(locator)], CallerOrigin::Local)?;
            let OperationResponse::ArtifactId(artifact) = dispatch(&mut pipeline, op).await? else {
                anyhow::bail!("unexpected response to addArtifact");
            };

            let op = classifier.classify(
                "startArtifact",
                &[json!(artifact.as_str())],
                CallerOrigin::Local,
            )?;
            dispatch(&mut pipeline, op).await?;
            info!(artifact_id = %artifact, "artifact running");

            wait_for_exit(duration_secs.map(Duration::from_secs)).await;

            let op = classifier.classify(
                "removeArtifact",
                &[json!(artifact.as_str())],
                CallerOrigin::System,
            )?;
            if let Err(err) = dispatch(&mut pipeline, op).await {
                warn!(artifact_id = %artifact, error = %err, "artifact removal failed");
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
