//! Extraction worker - main entry point.
//!
//! Wires the MQTT transport, the analysis capability, the persistence
//! pipeline, and the health server together, then runs until SIGINT or
//! SIGTERM.

use clap::{Parser, Subcommand};
use extraction_worker::config::WorkerConfig;
use extraction_worker::llm::{Analyzer, OpenAiAnalyzer, OpenAiAnalyzerConfig};
use extraction_worker::observability::{init_default_logging, HealthServer, WorkerStatus};
use extraction_worker::pipeline::Orchestrator;
use extraction_worker::reporter::ErrorReporter;
use extraction_worker::topology;
use extraction_worker::transport::mqtt::{ConnectionState, MqttClient};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Broker-driven text analysis worker
#[derive(Parser)]
#[command(name = "extraction-worker")]
#[command(about = "Broker-driven text analysis and persistence worker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(
        "Starting extraction worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_worker(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Worker shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(WorkerConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["worker.toml", "config/worker.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(WorkerConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create worker.toml"
                .into())
        }
    }
}

async fn run_worker(config: WorkerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(worker_id = %config.worker.id, "Worker starting");

    // Connect to the broker first; a worker that cannot reach it is useless.
    let mut client = MqttClient::new(&config.worker.id, &config.broker)?;
    client.connect().await?;
    let state_watch = client.state_watch();
    let transport = Arc::new(client);

    // Declare the work subscription before anything else can fail.
    let inbox = topology::provision(transport.as_ref(), &config.broker).await?;

    // Bind the health server socket; a port conflict is a startup error.
    let status = Arc::new(WorkerStatus::new());
    status.set_broker_connected(true);
    let health_server = Arc::new(HealthServer::new(
        config.worker.id.clone(),
        config.health.port,
        status.clone(),
    ));
    let (health_addr, health_future) = health_server.bind()?;
    info!(address = %health_addr, "Health server listening");
    tokio::spawn(health_future);

    // Mirror the transport's connection state into readiness.
    if let Some(mut state_rx) = state_watch {
        let status = status.clone();
        tokio::spawn(async move {
            loop {
                let connected = *state_rx.borrow() == ConnectionState::Connected;
                status.set_broker_connected(connected);
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    let analyzer = build_analyzer(&config)?;
    let reporter = Arc::new(ErrorReporter::new(config.reporting.endpoint.clone())?);

    let orchestrator = Arc::new(Orchestrator::new(
        config.worker.id.clone(),
        config.broker.storage_exchange.clone(),
        config.pipeline.clone(),
        transport.clone(),
        analyzer,
        reporter,
        status,
    ));
    let pipeline_handle = tokio::spawn(orchestrator.run(inbox));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Worker is running and waiting for work items...");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    info!("Worker shutdown initiated");
    transport.disconnect().await?;
    pipeline_handle.abort();
    Ok(())
}

fn build_analyzer(config: &WorkerConfig) -> Result<Arc<dyn Analyzer>, Box<dyn std::error::Error>> {
    match config.llm.provider.as_str() {
        "openai" => {
            let api_key = config.get_llm_api_key()?;
            let mut analyzer_config = OpenAiAnalyzerConfig {
                api_key,
                model: config.llm.model.clone(),
                temperature: config.llm.temperature,
                ..Default::default()
            };
            if let Some(base_url) = &config.llm.base_url {
                analyzer_config.base_url = base_url.clone();
            }
            Ok(Arc::new(OpenAiAnalyzer::new(analyzer_config)?))
        }
        provider => Err(format!("Unsupported LLM provider: {provider}").into()),
    }
}

fn handle_config_command(
    config: WorkerConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
