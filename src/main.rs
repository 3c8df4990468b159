use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use notegrid::config::{LaunchMode, NodeConfig, PeerConfig};
use notegrid::launcher::LaunchRequest;
use notegrid::node::Node;
use notegrid::scheduler::StaticResolver;
use notegrid::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "notegrid")]
#[command(version)]
#[command(about = "A clustered notebook-execution orchestrator")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a notegrid server node
    Server(ServerArgs),

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Note management commands
    Note {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NoteCommands,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LaunchModeArg {
    Local,
    Docker,
    Resource,
}

impl From<LaunchModeArg> for LaunchMode {
    fn from(mode: LaunchModeArg) -> Self {
        match mode {
            LaunchModeArg::Local => LaunchMode::Local,
            LaunchModeArg::Docker => LaunchMode::Containerized,
            LaunchModeArg::Resource => LaunchMode::ResourceManaged,
        }
    }
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for member-to-member traffic
    #[arg(long, default_value = "9470")]
    port: u16,

    /// Port for the internal API (optional)
    #[arg(long)]
    api_port: Option<u16>,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:9471,3:127.0.0.1:9472"
    #[arg(long, default_value = "")]
    peers: String,

    /// How backend processes are launched
    #[arg(long, value_enum, default_value = "local")]
    mode: LaunchModeArg,

    /// Backend runner binary (local mode)
    #[arg(long)]
    runner: Option<PathBuf>,

    /// Root of per-setting working directories
    #[arg(long)]
    working_root: Option<PathBuf>,

    /// Docker image for containerized backends
    #[arg(long)]
    image: Option<String>,

    /// Resource manager endpoint (resource mode)
    #[arg(long)]
    resource_manager: Option<String>,

    /// Backend group this node schedules onto
    #[arg(long, default_value = "default")]
    group: String,

    /// Backend setting name (names the working directory)
    #[arg(long, default_value = "shell")]
    setting: String,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// API address of a notegrid node
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9480")]
    addr: String,
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Show this node's view of the cluster
    Status,
}

#[derive(clap::Subcommand, Debug)]
enum NoteCommands {
    /// Create a note from paragraphs given on the command line
    Create {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// One paragraph of code per occurrence
        #[arg(long = "paragraph")]
        paragraphs: Vec<String>,
    },
    /// Run a note
    Run {
        #[arg(long)]
        id: String,
        #[arg(long)]
        blocking: bool,
        #[arg(long)]
        isolated: bool,
        /// key=value note parameters
        #[arg(long = "param")]
        params: Vec<String>,
    },
    /// Cancel a running note
    Cancel {
        #[arg(long)]
        id: String,
    },
    /// Show a note's jobs and statuses
    Status {
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Server(server) => run_server(server).await,
        Commands::Cluster { client, command } => match command {
            ClusterCommands::Status => {
                let body: serde_json::Value = reqwest::Client::new()
                    .get(format!("{}/api/cluster", client.addr))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&body)?);
                Ok(())
            }
        },
        Commands::Note { client, command } => run_note_command(client, command).await,
    }
}

async fn run_server(server: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", server.port).parse()?;
    let mut config = NodeConfig::new(server.node_id, listen_addr);
    config.peers = parse_peers(&server.peers)?;
    config.launcher.mode = server.mode.into();
    if let Some(runner) = server.runner {
        config.launcher.runner_path = runner;
    }
    if let Some(working_root) = server.working_root {
        config.launcher.working_root = working_root;
    }
    if let Some(image) = server.image {
        config.launcher.container.image = image;
    }
    if let Some(endpoint) = server.resource_manager {
        config.launcher.resource_manager.endpoint = endpoint;
    }

    let api_addr = server
        .api_port
        .map(|port| format!("0.0.0.0:{}", port).parse())
        .transpose()?;

    let resolver = Arc::new(StaticResolver::new(LaunchRequest::new(
        &server.group,
        &server.setting,
    )));

    tracing::info!(
        node_id = server.node_id,
        addr = %listen_addr,
        peers = config.peers.len(),
        "Starting notegrid node"
    );

    let node = Node::new(config, api_addr, resolver);
    let shutdown = install_shutdown_handler();
    node.run(shutdown).await?;
    Ok(())
}

async fn run_note_command(
    client: ClientArgs,
    command: NoteCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let http = reqwest::Client::new();
    match command {
        NoteCommands::Create {
            id,
            name,
            paragraphs,
        } => {
            let body: serde_json::Value = http
                .post(format!("{}/api/notes", client.addr))
                .json(&serde_json::json!({
                    "id": id,
                    "name": name,
                    "paragraphs": paragraphs,
                }))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        NoteCommands::Run {
            id,
            blocking,
            isolated,
            params,
        } => {
            let params: HashMap<String, String> = params
                .iter()
                .filter_map(|p| p.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            http.post(format!("{}/api/notes/{}/run", client.addr, id))
                .json(&serde_json::json!({
                    "blocking": blocking,
                    "isolated": isolated,
                    "params": params,
                }))
                .send()
                .await?
                .error_for_status()?;
            println!("note {} run {}", id, if blocking { "finished" } else { "submitted" });
        }
        NoteCommands::Cancel { id } => {
            http.post(format!("{}/api/notes/{}/cancel", client.addr, id))
                .send()
                .await?
                .error_for_status()?;
            println!("note {} cancelled", id);
        }
        NoteCommands::Status { id } => {
            let body: serde_json::Value = http
                .get(format!("{}/api/notes/{}", client.addr, id))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

fn parse_peers(peers: &str) -> Result<Vec<PeerConfig>, Box<dyn std::error::Error>> {
    let mut configs = Vec::new();
    for spec in peers.split(',').filter(|s| !s.is_empty()) {
        let mut parts = spec.splitn(2, ':');
        let node_id = parts
            .next()
            .ok_or("peer spec missing node id")?
            .parse::<u64>()?;
        let addr = parts.next().ok_or("peer spec missing address")?.to_string();
        configs.push(PeerConfig { node_id, addr });
    }
    Ok(configs)
}
