use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use clustercron::cluster::NodeHeartbeat;
use clustercron::scheduler::{
    Job, MisfirePolicy, RouteStrategy, Schedule, ShellType, Trigger, TriggerLog,
};
use clustercron::shutdown::install_shutdown_handler;
use clustercron::store::SqliteStore;
use clustercron::{SchedulerConfig, SchedulerNode};

#[derive(Parser, Debug)]
#[command(name = "clustercron")]
#[command(version)]
#[command(about = "A distributed job scheduler with store-arbitrated trigger claims")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a scheduler node until SIGINT/SIGTERM
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Trigger management commands
    Trigger {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TriggerCommands,
    },

    /// Execution log commands
    Log {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: LogCommands,
    },

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// SQLite database shared by every node of the cluster
    #[arg(long, default_value = "clustercron.db")]
    db: PathBuf,

    /// TOML configuration file; flags below override its values
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Cluster namespace
    #[arg(long)]
    namespace: Option<String>,

    /// Instance name (node ids are derived from it)
    #[arg(long)]
    instance_name: Option<String>,

    /// Start in standby: heartbeat only, never claim triggers
    #[arg(long)]
    standby: bool,

    /// Heartbeat and scan interval in milliseconds
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Number of dispatch workers
    #[arg(long)]
    pool_size: Option<usize>,

    /// Dispatch queue capacity (must be >= pool size)
    #[arg(long)]
    queue_size: Option<usize>,

    /// Working directory for shell job scripts and their logs
    #[arg(long)]
    shell_dir: Option<PathBuf>,
}

// =============================================================================
// Client Arguments (shared by admin commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// SQLite database shared by the cluster
    #[arg(long, default_value = "clustercron.db")]
    db: PathBuf,

    /// Cluster namespace
    #[arg(long, short = 'n', default_value = "default")]
    namespace: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Add a job that runs a script file through an interpreter
    AddShell {
        /// Job name
        name: String,
        /// Script content (e.g., "echo hello")
        content: String,
        /// Interpreter: bash, sh, ash, powershell, cmd, python, node, deno or php
        #[arg(long, default_value = "bash")]
        shell: ShellType,
        #[command(flatten)]
        options: JobOptions,
    },
    /// Add a job evaluated by the embedded script engine
    AddScript {
        /// Job name
        name: String,
        /// Script source
        source: String,
        #[command(flatten)]
        options: JobOptions,
    },
    /// List jobs of the namespace
    List,
    /// Enable a job
    Enable { job_id: Uuid },
    /// Disable a job; its triggers stop being claimed
    Disable { job_id: Uuid },
    /// Delete a job and its triggers
    Delete { job_id: Uuid },
}

#[derive(clap::Args, Debug)]
struct JobOptions {
    /// Hard timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Extra attempts within one fire after a failed run
    #[arg(long, default_value_t = 0)]
    retries: u32,
    /// Node routing: any, preferred:<names>, whitelist:<names> or blacklist:<names>
    #[arg(long, default_value = "any")]
    route: RouteStrategy,
}

impl JobOptions {
    fn apply(self, mut job: Job) -> Job {
        if let Some(ms) = self.timeout_ms {
            job = job.with_timeout(Duration::from_millis(ms));
        }
        job.with_retries(self.retries).with_route(self.route)
    }
}

// =============================================================================
// Trigger Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum TriggerCommands {
    /// Add a trigger to a job
    Add {
        /// The job ID (UUID)
        job_id: Uuid,
        /// Trigger name
        #[arg(long, default_value = "default")]
        name: String,
        /// Cron expression with seconds (e.g., "0 */5 * * * *")
        #[arg(long, conflicts_with = "every_ms", required_unless_present = "every_ms")]
        cron: Option<String>,
        /// Fixed interval in milliseconds
        #[arg(long)]
        every_ms: Option<u64>,
        /// First slot is the first one after this instant (RFC 3339)
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// No slot after this instant (RFC 3339)
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        /// fire_once or ignore
        #[arg(long, default_value = "fire_once")]
        misfire_policy: MisfirePolicy,
        /// Lateness tolerated before a slot counts as a misfire
        #[arg(long)]
        misfire_threshold_ms: Option<u64>,
    },
    /// List triggers of the namespace
    List,
    /// Pause a trigger
    Pause { trigger_id: Uuid },
    /// Resume a paused trigger
    Resume { trigger_id: Uuid },
    /// Fire a trigger now, outside its schedule
    Fire { trigger_id: Uuid },
}

// =============================================================================
// Log Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum LogCommands {
    /// List recent executions, newest first
    List {
        /// Only executions of this trigger
        #[arg(long)]
        trigger: Option<Uuid>,
        /// Maximum number of entries
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

// =============================================================================
// Cluster Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Show the nodes of the namespace and their liveness
    Status,
    /// List namespaces that have nodes or jobs
    Namespaces,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct CreatedOutput {
    id: Uuid,
}

#[derive(Serialize)]
struct NodeInfoOutput {
    node_id: String,
    instance_name: String,
    last_heartbeat: DateTime<Utc>,
    load_weight: f64,
    standby: bool,
    is_alive: bool,
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    namespace: String,
    live_nodes: usize,
    nodes: Vec<NodeInfoOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn describe_schedule(schedule: &Schedule) -> String {
    match schedule {
        Schedule::Cron { expression } => format!("cron {}", expression),
        Schedule::FixedInterval { every_ms } => format!("every {}ms", every_ms),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_created(kind: &str, id: Uuid, output: &OutputFormat) -> anyhow::Result<()> {
    match output {
        OutputFormat::Json => print_json(&CreatedOutput { id }),
        OutputFormat::Table => {
            println!("{} added successfully!", kind);
            println!("{} ID: {}", kind, id);
            Ok(())
        }
    }
}

/// Admin commands talk to the shared database directly; no node is started.
fn open_admin(client: &ClientArgs) -> anyhow::Result<SchedulerNode> {
    let store = SqliteStore::open(&client.db)
        .with_context(|| format!("opening {}", client.db.display()))?;
    let config = SchedulerConfig::new(client.namespace.clone(), "admin");
    Ok(SchedulerNode::with_store(config, store)?)
}

// =============================================================================
// Server Implementation
// =============================================================================

fn server_config(args: &ServerArgs) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_toml_file(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(instance_name) = &args.instance_name {
        config.instance_name = instance_name.clone();
    }
    if args.standby {
        config.standby = true;
    }
    if let Some(interval) = args.heartbeat_interval_ms {
        config.heartbeat_interval_ms = interval;
    }
    if let Some(pool_size) = args.pool_size {
        config.job_executor_pool_size = pool_size;
    }
    if let Some(queue_size) = args.queue_size {
        config.job_executor_queue_size = queue_size;
    }
    if let Some(dir) = &args.shell_dir {
        config.shell.working_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = server_config(&args)?;
    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("opening {}", args.db.display()))?;

    tracing::info!(
        db = %args.db.display(),
        namespace = %config.namespace,
        instance_name = %config.instance_name,
        standby = config.standby,
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        workers = config.job_executor_pool_size,
        "Starting clustercron node"
    );

    let shutdown = install_shutdown_handler()?;
    let node = SchedulerNode::with_store(config, store)?;
    node.start().await?;

    shutdown.cancelled().await;
    node.stop().await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job(client: &ClientArgs, command: JobCommands) -> anyhow::Result<()> {
    let node = open_admin(client)?;
    match command {
        JobCommands::AddShell {
            name,
            content,
            shell,
            options,
        } => {
            let job = options.apply(Job::shell(&client.namespace, name, shell, content));
            let id = node.add_job(&job).await?;
            print_created("Job", id, &client.output)?;
        }
        JobCommands::AddScript {
            name,
            source,
            options,
        } => {
            let job = options.apply(Job::script(&client.namespace, name, source));
            let id = node.add_job(&job).await?;
            print_created("Job", id, &client.output)?;
        }
        JobCommands::List => {
            let jobs = node.list_jobs(&client.namespace).await?;
            match client.output {
                OutputFormat::Json => print_json(&jobs)?,
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<38} {:<20} {:<8} {:<8} {:<8}",
                            "JOB ID", "NAME", "KIND", "ENABLED", "RUNS"
                        );
                        println!("{}", "-".repeat(86));
                        for job in &jobs {
                            println!(
                                "{:<38} {:<20} {:<8} {:<8} {:<8}",
                                job.id,
                                truncate(&job.name, 20),
                                job.kind(),
                                if job.enabled { "yes" } else { "no" },
                                job.run_count
                            );
                        }
                        println!();
                        println!("{} jobs", jobs.len());
                    }
                }
            }
        }
        JobCommands::Enable { job_id } => {
            node.enable_job(job_id).await?;
            println!("Job {} enabled", job_id);
        }
        JobCommands::Disable { job_id } => {
            node.disable_job(job_id).await?;
            println!("Job {} disabled", job_id);
        }
        JobCommands::Delete { job_id } => {
            node.delete_job(job_id).await?;
            println!("Job {} deleted", job_id);
        }
    }
    Ok(())
}

async fn handle_trigger(client: &ClientArgs, command: TriggerCommands) -> anyhow::Result<()> {
    let node = open_admin(client)?;
    match command {
        TriggerCommands::Add {
            job_id,
            name,
            cron,
            every_ms,
            start,
            end,
            misfire_policy,
            misfire_threshold_ms,
        } => {
            let schedule = match (cron, every_ms) {
                (Some(expression), None) => Schedule::cron(expression),
                (None, Some(ms)) => Schedule::every(Duration::from_millis(ms)),
                _ => bail!("exactly one of --cron or --every-ms is required"),
            };
            let job = node.get_job(job_id).await?;
            let mut trigger = Trigger::new(&job, name, schedule)?
                .with_misfire(misfire_policy, misfire_threshold_ms.map(Duration::from_millis));
            if let Some(start) = start {
                trigger = trigger.starting_at(start)?;
            }
            if let Some(end) = end {
                trigger = trigger.ending_at(end)?;
            }
            let id = node.add_trigger(&trigger).await?;
            match client.output {
                OutputFormat::Json => print_json(&CreatedOutput { id })?,
                OutputFormat::Table => {
                    println!("Trigger added successfully!");
                    println!("Trigger ID: {}", id);
                    println!("Next fire:  {}", format_time(trigger.next_fire_time));
                }
            }
        }
        TriggerCommands::List => {
            let triggers = node.list_triggers(&client.namespace).await?;
            match client.output {
                OutputFormat::Json => print_json(&triggers)?,
                OutputFormat::Table => {
                    if triggers.is_empty() {
                        println!("No triggers found.");
                    } else {
                        println!(
                            "{:<38} {:<18} {:<10} {:<24} OWNER",
                            "TRIGGER ID", "SCHEDULE", "STATUS", "NEXT FIRE"
                        );
                        println!("{}", "-".repeat(100));
                        for trigger in &triggers {
                            println!(
                                "{:<38} {:<18} {:<10} {:<24} {}",
                                trigger.id,
                                truncate(&describe_schedule(&trigger.schedule), 18),
                                trigger.status,
                                format_time(trigger.next_fire_time),
                                trigger.owner.as_deref().unwrap_or("-")
                            );
                        }
                    }
                }
            }
        }
        TriggerCommands::Pause { trigger_id } => {
            node.pause_trigger(trigger_id).await?;
            println!("Trigger {} paused", trigger_id);
        }
        TriggerCommands::Resume { trigger_id } => {
            node.resume_trigger(trigger_id).await?;
            println!("Trigger {} resumed", trigger_id);
        }
        TriggerCommands::Fire { trigger_id } => {
            node.fire_now(trigger_id).await?;
            println!("Trigger {} will fire on the next scan", trigger_id);
        }
    }
    Ok(())
}

fn print_logs(logs: &[TriggerLog]) {
    if logs.is_empty() {
        println!("No executions found.");
        return;
    }
    println!(
        "{:<38} {:<24} {:<9} {:<5} {:<22} OUTPUT",
        "TRIGGER ID", "STARTED", "OUTCOME", "EXIT", "NODE"
    );
    println!("{}", "-".repeat(110));
    for log in logs {
        let mut outcome = log.outcome.to_string();
        if log.misfire {
            outcome.push('*');
        }
        let detail = log
            .error
            .as_deref()
            .or(log.output.as_deref())
            .unwrap_or("")
            .replace('\n', " ");
        println!(
            "{:<38} {:<24} {:<9} {:<5} {:<22} {}",
            log.trigger_id,
            format_time(Some(log.start_time)),
            outcome,
            log.exit_code.map_or("-".to_string(), |c| c.to_string()),
            truncate(&log.node_id, 22),
            truncate(&detail, 40)
        );
    }
    println!();
    println!("* = misfire");
}

async fn handle_log(client: &ClientArgs, command: LogCommands) -> anyhow::Result<()> {
    let node = open_admin(client)?;
    match command {
        LogCommands::List { trigger, limit } => {
            let logs = node.list_logs(trigger, limit).await?;
            match client.output {
                OutputFormat::Json => print_json(&logs)?,
                OutputFormat::Table => print_logs(&logs),
            }
        }
    }
    Ok(())
}

async fn handle_cluster(client: &ClientArgs, command: ClusterCommands) -> anyhow::Result<()> {
    let node = open_admin(client)?;
    match command {
        ClusterCommands::Status => {
            let nodes = node.list_nodes(&client.namespace).await?;
            let stale_after = node.config().stale_after();
            let now = Utc::now();
            let infos: Vec<NodeInfoOutput> = nodes
                .into_iter()
                .map(|n: NodeHeartbeat| NodeInfoOutput {
                    is_alive: n.is_alive(now, stale_after),
                    node_id: n.node_id,
                    instance_name: n.instance_name,
                    last_heartbeat: n.last_heartbeat,
                    load_weight: n.load_weight,
                    standby: n.standby,
                })
                .collect();
            let output = ClusterStatusOutput {
                namespace: client.namespace.clone(),
                live_nodes: infos.iter().filter(|n| n.is_alive).count(),
                nodes: infos,
            };
            match client.output {
                OutputFormat::Json => print_json(&output)?,
                OutputFormat::Table => {
                    println!("Cluster Status");
                    println!("{}", "=".repeat(40));
                    println!("Namespace:  {}", output.namespace);
                    println!("Live nodes: {}", output.live_nodes);
                    println!();
                    println!("{:<30} {:<24} {:<8} STATUS", "NODE", "LAST HEARTBEAT", "MODE");
                    println!("{}", "-".repeat(75));
                    for n in &output.nodes {
                        let status = if n.is_alive { "[+] alive" } else { "[-] dead" };
                        let mode = if n.standby { "standby" } else { "active" };
                        println!(
                            "{:<30} {:<24} {:<8} {}",
                            truncate(&n.node_id, 30),
                            format_time(Some(n.last_heartbeat)),
                            mode,
                            status
                        );
                    }
                }
            }
        }
        ClusterCommands::Namespaces => {
            let namespaces = node.list_namespaces().await?;
            match client.output {
                OutputFormat::Json => print_json(&namespaces)?,
                OutputFormat::Table => {
                    for namespace in namespaces {
                        println!("{}", namespace);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Job { client, command } => handle_job(&client, command).await?,
        Commands::Trigger { client, command } => handle_trigger(&client, command).await?,
        Commands::Log { client, command } => handle_log(&client, command).await?,
        Commands::Cluster { client, command } => handle_cluster(&client, command).await?,
    }

    Ok(())
}
