use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use masternode::config::{ExecutorConfig, MasterConfig, TaskLimits, WorkerConfig};
use masternode::grpc::auth::SecretInjector;
use masternode::grpc::worker_client::master_client;
use masternode::jobsource::{JobSource, MemoryJobSource, PgJobSource};
use masternode::node::Node;
use masternode::proto::StatusRequest;
use masternode::shutdown::install_shutdown_handler;
use masternode::worker::run_worker;

#[derive(Parser, Debug)]
#[command(name = "masternode")]
#[command(version)]
#[command(about = "Contest scheduler dispatching compilations and matches to worker nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the masternode
    Master(MasterArgs),

    /// Start a worker node
    Worker(WorkerArgs),

    /// Show the workers registered on a masternode
    Status(StatusArgs),
}

// =============================================================================
// Master Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Address to listen on for gRPC
    #[arg(long, env = "MASTERNODE_LISTEN", default_value = "0.0.0.0:8067")]
    listen: SocketAddr,

    /// Port for the web dashboard (optional)
    #[arg(long, env = "MASTERNODE_DASHBOARD_PORT")]
    dashboard_port: Option<u16>,

    /// Contest database URL. Without it jobs are kept in memory, which is
    /// only useful for trying things out.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Root of the shared contest filesystem
    #[arg(long, env = "CONTEST_DIRECTORY", default_value = "/var/prologin/concours_shared")]
    contest_dir: PathBuf,

    /// Game name
    #[arg(long, env = "CONTEST_GAME", default_value = "prologin")]
    game: String,

    /// Seconds without heartbeat before a worker is declared dead
    #[arg(long, default_value = "10")]
    worker_timeout: u64,

    /// Attempts per task before it is failed
    #[arg(long, default_value = "3")]
    max_task_tries: u32,

    /// Compilation timeout in seconds
    #[arg(long, default_value = "400")]
    compilation_timeout: u64,

    /// Match timeout in seconds
    #[arg(long, default_value = "600")]
    match_timeout: u64,

    /// Shared secret expected on every RPC
    #[arg(long, env = "MASTERNODE_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Address to listen on for gRPC
    #[arg(long, env = "WORKERNODE_LISTEN", default_value = "0.0.0.0:8068")]
    listen: SocketAddr,

    /// Hostname advertised to the masternode
    #[arg(long, env = "WORKERNODE_HOSTNAME", default_value = "localhost")]
    hostname: String,

    /// Masternode address (host:port)
    #[arg(long, env = "MASTERNODE_ADDR", default_value = "127.0.0.1:8067")]
    master: String,

    /// Capacity in slots (a compilation takes 1, a match 5)
    #[arg(long, default_value = "10")]
    slots: u32,

    /// Seconds between heartbeats
    #[arg(long, default_value = "5")]
    heartbeat_interval: u64,

    /// Shell command compiling $CHAMPION_TGZ into $COMPILED_TGZ
    #[arg(long, env = "WORKERNODE_COMPILE_COMMAND")]
    compile_command: Option<String>,

    /// Shell command running a match into $OUTPUT_DIR
    #[arg(long, env = "WORKERNODE_MATCH_COMMAND")]
    match_command: Option<String>,

    /// Shared secret sent with every RPC
    #[arg(long, env = "MASTERNODE_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

// =============================================================================
// Status Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StatusArgs {
    /// Masternode address (host:port)
    #[arg(long, short = 'a', env = "MASTERNODE_ADDR", default_value = "127.0.0.1:8067")]
    addr: String,

    /// Shared secret sent with the request
    #[arg(long, env = "MASTERNODE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct WorkerStatusOutput {
    host: String,
    port: u32,
    slots: u32,
    max_slots: u32,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn non_zero_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let jobs: Arc<dyn JobSource> = match &args.database_url {
        Some(url) => Arc::new(PgJobSource::connect_lazy(url)?),
        None => {
            tracing::warn!("No database configured, using an empty in-memory job source");
            Arc::new(MemoryJobSource::new())
        }
    };

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut config = MasterConfig::new(args.listen)
        .with_contest(args.contest_dir, args.game)
        .with_worker_timeout(Duration::from_secs(args.worker_timeout))
        .with_shared_secret(args.secret);
    config.limits = TaskLimits {
        max_task_tries: args.max_task_tries,
        compilation_timeout: non_zero_timeout(args.compilation_timeout),
        match_timeout: non_zero_timeout(args.match_timeout),
        ..TaskLimits::default()
    };

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config, jobs, dashboard_addr)?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_worker_node(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let defaults = ExecutorConfig::default();
    let config = WorkerConfig {
        listen_addr: args.listen,
        hostname: args.hostname,
        max_slots: args.slots,
        master_addr: args.master,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        shared_secret: args.secret,
        executor: ExecutorConfig {
            compile_command: args.compile_command.unwrap_or(defaults.compile_command),
            match_command: args.match_command.unwrap_or(defaults.match_command),
            ..defaults
        },
    };

    let shutdown = install_shutdown_handler()?;
    run_worker(config, shutdown).await?;
    Ok(())
}

async fn handle_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let secret = SecretInjector::new(args.secret.as_deref())?;
    let mut client = master_client(&args.addr, secret, Duration::from_secs(10))?;
    let response = client.status(StatusRequest {}).await?.into_inner();

    match args.output {
        OutputFormat::Json => {
            let output: Vec<WorkerStatusOutput> = response
                .workers
                .into_iter()
                .map(|w| WorkerStatusOutput {
                    host: w.host,
                    port: w.port,
                    slots: w.slots,
                    max_slots: w.max_slots,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if response.workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!("{:<32} {:<6} {:>6} {:>9}", "HOST", "PORT", "SLOTS", "MAX SLOTS");
            println!("{}", "-".repeat(56));
            for w in &response.workers {
                println!("{:<32} {:<6} {:>6} {:>9}", w.host, w.port, w.slots, w.max_slots);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Master(master_args) => run_master(master_args).await?,
        Commands::Worker(worker_args) => run_worker_node(worker_args).await?,
        Commands::Status(status_args) => handle_status(status_args).await?,
    }

    Ok(())
}
