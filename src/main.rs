//! Elmnet node - main entry point

use clap::{Parser, Subcommand};
use elmnet::config::NodeConfig;
use elmnet::identity::NodeIdentity;
use elmnet::observability::{init_default_logging, init_logging, metrics, HealthServer, LogFormat};
use elmnet::{ElmnetNode, NodeComponents};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};

/// Decentralized routing and reputation node
#[derive(Parser)]
#[command(name = "elmnet")]
#[command(about = "Elmnet routing and reputation node")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ELMNET_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Print this node's agent id, generating a key if there is none
    Identity {
        /// Key file to use instead of the configured one
        #[arg(long, value_name = "FILE")]
        key_file: Option<PathBuf>,
    },
    /// Start the node, run one query session and print the report
    Query {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        text: String,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format(), false),
        _ => init_logging(Level::TRACE, log_format(), true),
    }

    let result = match cli.command {
        Commands::Identity { key_file } => show_identity(cli.config.as_deref(), key_file),
        command => match load_configuration(cli.config.as_deref()) {
            Ok(config) => match command {
                Commands::Run => run_node(config).await,
                Commands::Config { show } => handle_config_command(&config, show),
                Commands::Query { topic, text } => run_query(config, &topic, &text).await,
                Commands::Identity { .. } => Ok(()),
            },
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn log_format() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()))
}

fn load_configuration(path: Option<&Path>) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(NodeConfig::load_from_file(path)?);
    }

    for candidate in ["elmnet.toml", "config/elmnet.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(NodeConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create elmnet.toml".into())
}

fn build_node(config: NodeConfig) -> Result<Arc<ElmnetNode>, Box<dyn std::error::Error>> {
    let identity = NodeIdentity::load_or_generate(&config.node.key_file)?;
    let components = NodeComponents::from_config(&config, &identity)?;
    Ok(ElmnetNode::new(config, identity, components)?)
}

async fn run_node(config: NodeConfig) -> CliResult {
    let http_port = config.node.http_port;
    let node = build_node(config)?;
    info!(
        "Starting elmnet v{} as {} ({})",
        env!("CARGO_PKG_VERSION"),
        node.agent_id(),
        node.role()
    );

    let addr = node.listen_tcp().await?;
    info!(%addr, endpoint = %node.endpoint(), "Accepting peers");

    if let Some(port) = http_port {
        let server = HealthServer::new(node.clone(), port);
        let shutdown = node.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Operator HTTP server error: {}", e);
            }
        });
    }

    node.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    if let Err(e) = node.shutdown().await {
        metrics().set_node_state("error");
        return Err(e.into());
    }
    Ok(())
}

async fn run_query(config: NodeConfig, topic: &str, text: &str) -> CliResult {
    let node = build_node(config)?;
    node.listen_tcp().await?;
    node.start().await?;

    let outcome = node.query(topic, text).await;
    node.shutdown().await?;

    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_config_command(config: &NodeConfig, show: bool) -> CliResult {
    if show {
        println!("{}", config.to_toml_string()?);
    }
    info!("Configuration validation complete");
    Ok(())
}

fn show_identity(config_path: Option<&Path>, key_file: Option<PathBuf>) -> CliResult {
    let key_file = match key_file {
        Some(path) => path,
        None => load_configuration(config_path)?.node.key_file,
    };
    let identity = NodeIdentity::load_or_generate(&key_file)?;
    println!("agent_id   {}", identity.agent_id());
    println!("public_key {}", identity.public_key_hex());
    Ok(())
}
