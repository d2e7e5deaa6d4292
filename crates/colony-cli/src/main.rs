mod config;

use clap::{Parser, Subcommand};
use colony_cluster::NodeSyncManager;
use colony_collab::CollaborationEngine;
use colony_core::{collab_events, validate, TaskRequest};
use colony_scheduler::{AutonomyController, Dispatcher};
use config::ColonyConfig;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "colony", about = "Colony — agent task scheduler and dispatch node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "colony.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scheduler node
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate a task request file (one JSON object or an array of them)
    Validate {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = ColonyConfig::load(&cli.config).await?;
            if let Some(host) = host {
                config.node.host = host;
            }
            if let Some(port) = port {
                config.node.listen_port = port;
            }
            serve(config).await
        }
        Commands::Validate { file } => validate_file(&file).await,
    }
}

async fn serve(config: ColonyConfig) -> anyhow::Result<()> {
    info!(
        node = %config.node.node_name,
        agents = config.agents.len(),
        peers = config.node.peers.len(),
        "Starting colony node"
    );

    let dispatcher = Dispatcher::new(config.scheduler.clone());
    dispatcher.start();
    for entry in &config.agents {
        dispatcher.register_agent(entry.to_agent())?;
    }

    let sync = NodeSyncManager::new(config.node.clone(), config.peer_link.clone());
    sync.set_executor(Arc::new(dispatcher.clone()));

    let collab = Arc::new(CollaborationEngine::new().with_cluster(Arc::new(sync.clone())));
    for kind in collab_events::ALL {
        let engine = collab.clone();
        sync.register_handler(kind, move |inbound| {
            let data = inbound.message.data.unwrap_or(Value::Null);
            engine.observe_remote(&inbound.message.kind, inbound.message.from, data);
        });
    }

    let autonomy = AutonomyController::new(config.autonomy.clone(), dispatcher.clone(), None);
    if config.autonomy.enabled {
        autonomy.enable();
        info!(interval_ms = autonomy.config().interval_ms, "Autonomy enabled");
    }

    let addr = sync.start().await?;
    info!(%addr, "Colony node listening");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    autonomy.disable();
    sync.shutdown().await;
    dispatcher.shutdown().await;
    info!(sessions = collab.list_sessions().len(), "Colony node stopped");
    Ok(())
}

async fn validate_file(file: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read '{}': {e}", file.display()))?;
    let requests: Vec<TaskRequest> = match serde_json::from_str::<Value>(&raw)? {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };

    let mut invalid = 0;
    for (index, request) in requests.iter().enumerate() {
        let result = validate(request);
        if result.valid {
            println!("#{index} {}: ok", request.action);
        } else {
            invalid += 1;
            println!("#{index} {}: invalid", request.action);
            for error in &result.errors {
                println!("    - {error}");
            }
        }
    }
    println!("\nTotal: {} task(s), {invalid} invalid", requests.len());

    if invalid > 0 {
        anyhow::bail!("{invalid} task request(s) failed validation");
    }
    Ok(())
}
