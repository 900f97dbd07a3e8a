use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use wipd::core::assets::AssetCatalog;
use wipd::core::devices::DeviceRegistry;
use wipd::core::guard::MountGuard;
use wipd::core::pipeline::PipelineExecutor;
use wipd::core::scheduler::Scheduler;
use wipd::imaging::{DismTool, ImagingTool, SimulatedTool};
use wipd::web::WebServer;
use wipd::{config, context, db, logging};

#[derive(Parser)]
#[command(name = "wipd")]
#[command(about = "Windows Image Preparation Daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Daemon(ServerArgs),
    Status,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    assets_root: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    devices_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mount_slots: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    dism_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::new(Some(args))?,
        _ => config::AppConfig::new(None::<&ServerArgs>)?,
    };

    match &cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Failed to start daemon")?,
        Commands::Status => run_status(&config)
            .await
            .context("Failed to check status of daemon")?,
    }

    Ok(())
}

async fn run_daemon(config: config::AppConfig) -> Result<()> {
    logging::init(logging::LogConfig {
        json: config.log_json,
        verbose: config.verbose,
    });
    config.ensure_runtime_dirs()?;

    let db_conn = db::init(&config.database_path).await?;
    let ctx = context::AppContext::new(config, db_conn);
    let config = ctx.config.clone();

    let registry = Arc::new(DeviceRegistry::load(&config.devices_dir)?);
    tracing::info!(devices = registry.len(), "device registry loaded");
    let catalog = Arc::new(AssetCatalog::new(
        &config.assets_root,
        config.min_image_bytes,
    ));

    let tool: Arc<dyn ImagingTool> = if config.simulation {
        tracing::warn!("running in simulation mode, no images will be modified");
        let (tool, _journal) = SimulatedTool::new();
        Arc::new(tool)
    } else {
        Arc::new(DismTool::new(
            &config.dism_path,
            Duration::from_secs(config.stage_timeout_secs),
        ))
    };

    let guard = MountGuard::new(config.mount_slots);
    let executor = PipelineExecutor::new(ctx.clone(), tool, guard, catalog, registry.clone());
    let (scheduler, _dispatcher) =
        Scheduler::start(ctx.clone(), executor, registry, config.queue_capacity);
    scheduler.recover_interrupted().await?;

    let _heartbeat = ctx.broadcaster.start_heartbeat(
        Duration::from_secs(config.heartbeat_secs),
        ctx.tracker.clone(),
    );

    let server = Arc::new(WebServer::new(ctx.clone(), scheduler, config.http_bind));
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.shutdown();
    server_task.await??;

    Ok(())
}

async fn run_status(config: &config::AppConfig) -> Result<()> {
    let url = format!("http://{}/api/health", config.http_bind);
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .with_context(|| format!("daemon not reachable at {url}"))?;
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
