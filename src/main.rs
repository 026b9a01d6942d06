use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use markhive::broadcast::Broadcaster;
use markhive::config::{NodeConfig, PluginConfig, SandboxConfig, TlsConfig};
use markhive::hooks::{GlobalEvent, HookRegistry};
use markhive::node::Node;
use markhive::queue::{ExecutorRegistry, Job, JobStatus, JobStore, SandboxExecutor};
use markhive::registry::{NodeRegistry, PeerDirectory};
use markhive::rpc::{LifecycleAck, Peer, PeerClient};
use markhive::shutdown::install_shutdown_handler;
use markhive::store::{Store, StoreOptions};
use markhive::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "markhive")]
#[command(version)]
#[command(about = "Cluster coordination for distributed assessment marking")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a marking node
    Server(ServerArgs),

    /// Remote control of a single node
    Node {
        #[command(flatten)]
        remote: RemoteArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Job queue commands
    Job {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        remote: ClientTlsArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Cluster registry commands
    Cluster {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node UUID; a fresh one is generated when omitted
    #[arg(long)]
    node_uuid: Option<Uuid>,

    /// Human-readable node title
    #[arg(long, default_value = "Marking Node")]
    title: String,

    /// Address the control plane listens on
    #[arg(long, default_value = "0.0.0.0:1099")]
    listen: SocketAddr,

    /// Host peers use to reach this node
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Do not export the control plane (the node only drains the queue)
    #[arg(long)]
    no_rpc: bool,

    /// Shared database URL
    #[arg(long, default_value = "sqlite:markhive.db")]
    database: String,

    #[arg(long, default_value = "5000")]
    heartbeat_ms: u64,

    #[arg(long, default_value = "60000")]
    liveness_ms: u64,

    #[arg(long, default_value = "10000")]
    poll_ms: u64,

    #[arg(long, default_value = "5000")]
    rpc_timeout_ms: u64,

    #[arg(long, default_value = "10000")]
    lock_timeout_ms: u64,

    /// Reclaim claims older than this regardless of the owner's heartbeat
    #[arg(long, default_value = "120000")]
    work_timeout_ms: u64,

    /// Concurrent marking workers on this node
    #[arg(long, default_value = "2")]
    workers: usize,

    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Docker image used for sandboxed marking runs
    #[arg(long, default_value = "alpine:latest")]
    image: String,

    /// Job kinds marked by the sandbox executor (comma-separated)
    #[arg(long, default_value = "sandbox")]
    sandbox_kinds: String,

    /// Plugin directory (used when --dev-plugins is set)
    #[arg(long)]
    plugin_path: Option<PathBuf>,

    /// Development mode: load plugins from --plugin-path
    #[arg(long)]
    dev_plugins: bool,

    // === TLS Options ===
    /// Enable mutual TLS on the control plane
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to node certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to node private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Allow running without TLS even when --tls is specified but certs are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientTlsArgs {
    /// Path to CA certificate (PEM format) for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (PEM format) for mTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format) for mTLS
    #[arg(long)]
    key: Option<PathBuf>,

    /// Per-call timeout
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,
}

#[derive(Parser, Debug)]
struct RemoteArgs {
    /// Node control-plane address
    #[arg(long, short = 'a', global = true, default_value = "127.0.0.1:1099")]
    addr: String,

    #[command(flatten)]
    tls: ClientTlsArgs,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Shared database URL
    #[arg(long, global = true, default_value = "sqlite:markhive.db")]
    database: String,

    /// Node liveness threshold
    #[arg(long, default_value = "60000")]
    liveness_ms: u64,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum HookEvent {
    WorkWake,
    CacheInvalidate,
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// Ask the node to restart its subsystems
    Restart,
    /// Ask the node to shut down
    Shutdown,
    /// Unload a plugin on the node
    UnloadPlugin {
        /// Plugin UUID
        plugin: Uuid,
    },
    /// Invoke a global hook on the node
    Hook {
        #[arg(long)]
        event: HookEvent,

        /// Cache key for cache-invalidate
        #[arg(long, default_value = "")]
        key: String,

        /// Deliver to every handler instead of stopping at the first
        #[arg(long)]
        all: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Queue a marking job and wake the cluster
    Submit {
        /// Job kind (selects the executor)
        #[arg(long)]
        kind: String,

        /// JSON payload, e.g. '{"command": "java Main"}'
        #[arg(long)]
        payload: String,
    },
    /// Show a job
    Status {
        #[arg(long)]
        id: i64,
    },
    /// List jobs
    List {
        /// Only jobs in this status (e.g. awaiting_marking)
        #[arg(long)]
        status: Option<JobStatus>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// List registered nodes and their liveness
    Status,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeInfoOutput {
    uuid: String,
    title: String,
    rpc: Option<String>,
    last_heartbeat: String,
    online: bool,
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    online: usize,
    nodes: Vec<NodeInfoOutput>,
}

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: i64,
    woken: usize,
    unreachable: usize,
}

#[derive(Serialize)]
struct HookOutput {
    handled: Option<bool>,
}

// =============================================================================
// Helpers
// =============================================================================

async fn client_tls(args: &ClientTlsArgs) -> Result<Option<TlsIdentity>, Box<dyn std::error::Error>> {
    let config = TlsConfig {
        enabled: args.ca_cert.is_some() || args.cert.is_some() || args.key.is_some(),
        ca_cert_path: args.ca_cert.clone(),
        cert_path: args.cert.clone(),
        key_path: args.key.clone(),
        allow_insecure: false,
    };
    Ok(TlsIdentity::from_config(&config).await?)
}

async fn open_store(args: &StoreArgs) -> Result<Arc<Store>, Box<dyn std::error::Error>> {
    Ok(Arc::new(Store::open(StoreOptions::new(args.database.clone())).await?))
}

fn print_job(job: &Job, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => {
            println!("Job ID:       {}", job.id);
            println!("Kind:         {}", job.kind);
            println!("Status:       {}", job.status);
            println!("Attempts:     {}", job.attempts);
            if let Some(node) = job.claimed_by {
                println!("Claimed By:   {}", node);
            }
            println!("Created:      {}", job.created_at.to_rfc3339());
            if let Some(completed) = job.completed_at {
                println!("Completed:    {}", completed.to_rfc3339());
            }
            if let Some(ref result) = job.result {
                println!("Result:       {}", result);
            }
            if let Some(ref error) = job.error {
                println!("Error:        {}", error);
            }
        }
    }
    Ok(())
}

fn print_lifecycle(ack: &LifecycleAck, action: &str, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(ack)?),
        OutputFormat::Table => {
            if ack.accepted {
                println!("{} requested (node was {})", action, ack.state);
            } else {
                println!("{} rejected: node is {}", action, ack.state);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig {
        node_uuid: args.node_uuid.unwrap_or_else(Uuid::new_v4),
        title: args.title,
        listen_addr: args.listen,
        advertise_host: if args.no_rpc {
            None
        } else {
            Some(args.advertise_host)
        },
        database_url: args.database,
        heartbeat_interval_ms: args.heartbeat_ms,
        liveness_threshold_ms: args.liveness_ms,
        rpc_timeout_ms: args.rpc_timeout_ms,
        lock_timeout_ms: args.lock_timeout_ms,
        poll_interval_ms: args.poll_ms,
        work_timeout_ms: args.work_timeout_ms,
        worker_count: args.workers,
        max_attempts: args.max_attempts,
        sandbox: SandboxConfig {
            image: args.image,
            ..SandboxConfig::default()
        },
        tls: TlsConfig {
            enabled: args.tls,
            ca_cert_path: args.ca_cert,
            cert_path: args.cert,
            key_path: args.key,
            allow_insecure: args.allow_insecure,
        },
        plugins: PluginConfig {
            path: args.plugin_path,
            dev_override: args.dev_plugins,
        },
        ..NodeConfig::default()
    };

    if !config.tls.enabled && config.advertise_host.is_some() {
        tracing::warn!(
            "Control plane exported without TLS. \
             Consider using --tls for production deployments."
        );
    }

    let sandbox = Arc::new(SandboxExecutor::new(config.sandbox.clone()));
    let mut executors = ExecutorRegistry::new();
    for kind in args.sandbox_kinds.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        executors.register(kind, sandbox.clone());
    }

    tracing::info!(
        node = %config.node_uuid,
        listen_addr = %config.listen_addr,
        advertise_host = ?config.advertise_host,
        database = %config.database_url,
        tls_enabled = config.tls.enabled,
        "Starting markhive node"
    );

    let node = Node::new(config).with_executors(executors);
    install_shutdown_handler(node.handle())?;
    node.run().await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_node(remote: RemoteArgs, command: NodeCommands) -> Result<(), Box<dyn std::error::Error>> {
    let tls = client_tls(&remote.tls).await?;
    let client = PeerClient::new(Uuid::new_v4(), Duration::from_millis(remote.tls.timeout_ms), tls);
    let peer = Peer::direct(&remote.addr)?;

    match command {
        NodeCommands::Restart => {
            let ack = client.restart(&peer).await?;
            print_lifecycle(&ack, "Restart", &remote.output)?;
        }
        NodeCommands::Shutdown => {
            let ack = client.shutdown(&peer).await?;
            print_lifecycle(&ack, "Shutdown", &remote.output)?;
        }
        NodeCommands::UnloadPlugin { plugin } => {
            let unloaded = client.unload_plugin(&peer, plugin).await?;
            match remote.output {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "plugin": plugin, "unloaded": unloaded }))
                }
                OutputFormat::Table => {
                    if unloaded {
                        println!("Plugin {} unloaded", plugin);
                    } else {
                        println!("Plugin {} was not loaded", plugin);
                    }
                }
            }
        }
        NodeCommands::Hook { event, key, all } => {
            let event = match event {
                HookEvent::WorkWake => GlobalEvent::WorkWake { job_id: None },
                HookEvent::CacheInvalidate => GlobalEvent::CacheInvalidate { key },
            };
            let handled = if all {
                client.invoke_global_hook_all(&peer, &event).await?;
                None
            } else {
                Some(client.invoke_global_hook(&peer, &event).await?)
            };
            match remote.output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&HookOutput { handled })?)
                }
                OutputFormat::Table => match handled {
                    Some(true) => println!("{} handled", event.name()),
                    Some(false) => println!("{} not handled", event.name()),
                    None => println!("{} delivered to all handlers", event.name()),
                },
            }
        }
    }
    Ok(())
}

async fn handle_job(
    store_args: StoreArgs,
    tls_args: ClientTlsArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&store_args).await?;
    let jobs = JobStore::new(store.clone());

    match command {
        JobCommands::Submit { kind, payload } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let job_id = jobs.insert(&kind, &payload).await?;

            // Wake inline; the process exits right after.
            let origin = Uuid::new_v4();
            let registry = Arc::new(NodeRegistry::new(
                store.clone(),
                Duration::from_millis(store_args.liveness_ms),
            ));
            let client = PeerClient::new(
                origin,
                Duration::from_millis(tls_args.timeout_ms),
                client_tls(&tls_args).await?,
            );
            let broadcaster = Broadcaster::new(
                origin,
                registry,
                PeerDirectory::new(),
                client,
                Arc::new(HookRegistry::new()),
            );
            let report = broadcaster.wake_all(Some(job_id)).await;

            match store_args.output {
                OutputFormat::Json => {
                    let output = JobSubmitOutput {
                        job_id,
                        woken: report.delivered,
                        unreachable: report.failed,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job_id);
                    println!("Woke {} node(s), {} unreachable", report.delivered, report.failed);
                }
            }
        }
        JobCommands::Status { id } => match jobs.get(id).await? {
            Some(job) => print_job(&job, &store_args.output)?,
            None => {
                eprintln!("Error: job {} not found", id);
                std::process::exit(1);
            }
        },
        JobCommands::List { status } => {
            let list = jobs.list(status).await?;
            match store_args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&list)?),
                OutputFormat::Table => {
                    if list.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<8} {:<24} {:<16} {:<8} CLAIMED BY", "ID", "STATUS", "KIND", "TRIES");
                        println!("{}", "-".repeat(96));
                        for job in &list {
                            let claimant = job
                                .claimed_by
                                .map(|u| u.to_string())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<8} {:<24} {:<16} {:<8} {}",
                                job.id,
                                job.status.to_string(),
                                job.kind,
                                job.attempts,
                                claimant
                            );
                        }
                    }
                }
            }
        }
    }
    store.close().await;
    Ok(())
}

async fn handle_cluster(
    store_args: StoreArgs,
    command: ClusterCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&store_args).await?;
    let threshold = Duration::from_millis(store_args.liveness_ms);
    let registry = NodeRegistry::new(store.clone(), threshold);

    match command {
        ClusterCommands::Status => {
            let now = chrono::Utc::now();
            let nodes: Vec<NodeInfoOutput> = registry
                .list_all()
                .await?
                .into_iter()
                .map(|n| NodeInfoOutput {
                    online: n.is_online_at(now, threshold),
                    rpc: n.rpc_endpoint().map(|(h, p)| format!("{}:{}", h, p)),
                    last_heartbeat: n.last_heartbeat.to_rfc3339(),
                    uuid: n.uuid.to_string(),
                    title: n.title,
                })
                .collect();
            let online = nodes.iter().filter(|n| n.online).count();

            match store_args.output {
                OutputFormat::Json => {
                    let output = ClusterStatusOutput { online, nodes };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Online nodes: {} of {}", online, nodes.len());
                    println!();
                    println!("{:<38} {:<20} {:<22} {:<8}", "NODE", "TITLE", "RPC", "STATUS");
                    println!("{}", "-".repeat(90));
                    for node in &nodes {
                        let status = if node.online { "online" } else { "offline" };
                        println!(
                            "{:<38} {:<20} {:<22} {:<8}",
                            node.uuid,
                            node.title,
                            node.rpc.as_deref().unwrap_or("-"),
                            status
                        );
                    }
                }
            }
        }
    }
    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Node { remote, command } => handle_node(remote, command).await,
        Commands::Job {
            store,
            remote,
            command,
        } => handle_job(store, remote, command).await,
        Commands::Cluster { store, command } => handle_cluster(store, command).await,
    }
}
