use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use queuectl::config::WorkerConfig;
use queuectl::dashboard::{run_dashboard, DashboardState};
use queuectl::error::QueueError;
use queuectl::shutdown::install_shutdown_handler;
use queuectl::store::{JobState, JobStore, NewJob};
use queuectl::worker::WorkerPool;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A durable job queue for shell commands with retries and a dead-letter queue")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the SQLite job store
    #[arg(long, global = true, default_value = "queue.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Add a new job to the queue
    Enqueue(EnqueueArgs),

    /// Manage worker processes
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Show a summary of all job states
    Status,

    /// List jobs, most recently updated first
    List(ListArgs),

    /// Manage the dead-letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// View the saved stdout/stderr for a job
    Log {
        /// The job id to view
        job_id: String,
    },

    /// Show execution stats and metrics
    Stats,

    /// Serve the read-only jobs API over HTTP
    Serve {
        /// Port to bind the HTTP server on
        #[arg(long, default_value = "4000")]
        port: u16,
    },
}

// =============================================================================
// Enqueue Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct EnqueueArgs {
    /// Unique job id
    #[arg(long)]
    id: String,

    /// The shell command to run
    #[arg(long)]
    command: String,

    /// Job priority (higher number = dispatched first)
    #[arg(long, default_value = "0")]
    priority: i64,

    /// Delay job eligibility by N seconds
    #[arg(long, default_value = "0")]
    delay: i64,

    /// Max attempts for this job (defaults to the max_retries config key)
    #[arg(long)]
    max_retries: Option<i64>,
}

// =============================================================================
// Worker Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// Start worker instances; stop them with Ctrl-C or SIGTERM
    Start {
        /// Number of workers to start
        #[arg(long, short = 'c', default_value = "1")]
        count: usize,

        /// Sleep between polls when no job is eligible (milliseconds)
        #[arg(long, default_value = "1000")]
        poll_interval_ms: u64,

        /// Hard cap on a single command execution (milliseconds)
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,

        /// Age after which a processing lock is considered abandoned
        /// (milliseconds); must exceed the execution timeout
        #[arg(long, default_value = "60000")]
        stale_lock_ms: u64,

        /// Ceiling on the exponential retry delay (seconds)
        #[arg(long, default_value = "3600")]
        backoff_cap_secs: u64,
    },
}

// =============================================================================
// List Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ListArgs {
    /// Filter jobs by state (pending, processing, completed, failed, dead)
    #[arg(long, short = 's')]
    state: Option<String>,

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
// DLQ and Config Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum DlqCommands {
    /// List all jobs in the dead-letter queue
    List,
    /// Move a dead job back to the queue with a fresh attempt budget
    Retry {
        /// The job id to retry
        job_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// List all config keys and values
    List,
    /// Set an existing config key (max_retries, backoff_base)
    Set { key: String, value: String },
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_enqueue(
    store: &JobStore,
    args: EnqueueArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let new = NewJob {
        id: args.id,
        command: args.command,
        priority: args.priority,
        delay_secs: args.delay,
        max_retries: args.max_retries,
    };

    match store.enqueue(new).await {
        Ok(job) => {
            if args.delay > 0 {
                println!(
                    "Job enqueued: {} (priority {}). Eligible after {} seconds.",
                    job.id, job.priority, args.delay
                );
            } else {
                println!("Job enqueued: {} (priority {}).", job.id, job.priority);
            }
        }
        Err(QueueError::DuplicateId(id)) => {
            eprintln!("Error: a job with id \"{}\" already exists.", id);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn handle_worker_start(
    db: &str,
    count: usize,
    config: WorkerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config.validate()?;

    let store = Arc::new(JobStore::connect(db).await?);
    let token = install_shutdown_handler();

    tracing::info!(
        count,
        poll_interval_ms = config.poll_interval_ms,
        exec_timeout_ms = config.exec_timeout_ms,
        stale_lock_ms = config.stale_lock_ms,
        "Starting workers"
    );

    let pool = WorkerPool::spawn(count, store, config, token.clone());
    println!(
        "{} worker(s) started. Press Ctrl-C to stop after current jobs.",
        count
    );

    token.cancelled().await;
    pool.join().await;
    println!("All workers stopped.");
    Ok(())
}

async fn handle_status(store: &JobStore) -> Result<(), Box<dyn std::error::Error>> {
    let counts = store.counts_by_state().await?;
    if counts.is_empty() {
        println!("No jobs in the queue.");
        return Ok(());
    }

    println!("{:<12} COUNT", "STATE");
    println!("{}", "-".repeat(20));
    for (state, count) in counts {
        println!("{:<12} {}", state.to_string(), count);
    }
    Ok(())
}

async fn handle_list(store: &JobStore, args: ListArgs) -> Result<(), Box<dyn std::error::Error>> {
    let state = match args.state.as_deref() {
        Some(raw) => match raw.parse::<JobState>() {
            Ok(state) => Some(state),
            Err(e) => {
                eprintln!("Error: {}", e);
                return Ok(());
            }
        },
        None => None,
    };

    let jobs = store.jobs_by_state(state).await?;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                match state {
                    Some(state) => println!("No jobs found with state: {}", state),
                    None => println!("No jobs found in the queue."),
                }
                return Ok(());
            }

            println!(
                "{:<22} {:<12} {:<9} {:<42} UPDATED AT",
                "ID", "STATE", "ATTEMPTS", "COMMAND"
            );
            println!("{}", "-".repeat(110));
            for job in &jobs {
                println!(
                    "{:<22} {:<12} {:<9} {:<42} {}",
                    truncate(&job.id, 20),
                    job.state.to_string(),
                    job.attempts,
                    truncate(&job.command, 40),
                    job.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
            println!("{} job(s)", jobs.len());
        }
    }
    Ok(())
}

async fn handle_dlq_list(store: &JobStore) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = store.jobs_by_state(Some(JobState::Dead)).await?;
    if jobs.is_empty() {
        println!("Dead-letter queue is empty.");
        return Ok(());
    }

    println!(
        "{:<22} {:<9} {:<42} UPDATED AT",
        "ID", "ATTEMPTS", "COMMAND"
    );
    println!("{}", "-".repeat(98));
    for job in &jobs {
        println!(
            "{:<22} {:<9} {:<42} {}",
            truncate(&job.id, 20),
            job.attempts,
            truncate(&job.command, 40),
            job.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn handle_dlq_retry(
    store: &JobStore,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    match store.retry_dead(&job_id).await {
        Ok(()) => println!("Job {} moved back to the queue for retry.", job_id),
        Err(QueueError::JobNotFound(_)) => {
            eprintln!("No job found in the dead-letter queue with id: {}", job_id);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn handle_config_list(store: &JobStore) -> Result<(), Box<dyn std::error::Error>> {
    let entries = store.config_list().await?;
    println!("{:<16} VALUE", "KEY");
    println!("{}", "-".repeat(28));
    for (key, value) in entries {
        println!("{:<16} {}", key, value);
    }
    Ok(())
}

async fn handle_config_set(
    store: &JobStore,
    key: String,
    value: String,
) -> Result<(), Box<dyn std::error::Error>> {
    match store.config_set(&key, &value).await {
        Ok(()) => println!("Config updated: {} = {}", key, value),
        Err(QueueError::ConfigKeyNotFound(_)) => {
            eprintln!("Config key \"{}\" not found.", key);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn handle_log(store: &JobStore, job_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let Some(job) = store.job(&job_id).await? else {
        eprintln!("No job found with id: {}", job_id);
        return Ok(());
    };

    println!("Job ID: {}", job.id);
    println!("State:  {}", job.state);
    println!();
    println!("--- stdout ---");
    println!("{}", job.stdout.as_deref().unwrap_or("(empty)"));
    println!();
    println!("--- stderr ---");
    println!("{}", job.stderr.as_deref().unwrap_or("(empty)"));
    Ok(())
}

async fn handle_stats(store: &JobStore) -> Result<(), Box<dyn std::error::Error>> {
    let counts = store.counts_by_state().await?;

    println!("Job counts:");
    if counts.is_empty() {
        println!("  no jobs in queue");
    } else {
        for (state, count) in counts {
            println!("  {:<12} {}", state.to_string(), count);
        }
    }

    println!();
    match store.average_duration_secs().await? {
        Some(avg) => println!("Avg. completed job duration: {:.2} seconds", avg),
        None => println!("Avg. completed job duration: n/a (no completed jobs)"),
    }
    Ok(())
}

async fn handle_serve(db: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(JobStore::connect(db).await?);
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let token = install_shutdown_handler();

    run_dashboard(addr, DashboardState { store }, token).await;
    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Worker { command } => match command {
            WorkerCommands::Start {
                count,
                poll_interval_ms,
                timeout_ms,
                stale_lock_ms,
                backoff_cap_secs,
            } => {
                let config = WorkerConfig {
                    poll_interval_ms,
                    exec_timeout_ms: timeout_ms,
                    stale_lock_ms,
                    backoff_cap_secs,
                };
                handle_worker_start(&args.db, count, config).await?;
            }
        },
        Commands::Serve { port } => {
            handle_serve(&args.db, port).await?;
        }
        command => {
            let store = JobStore::connect(&args.db).await?;
            match command {
                Commands::Enqueue(enqueue_args) => handle_enqueue(&store, enqueue_args).await?,
                Commands::Status => handle_status(&store).await?,
                Commands::List(list_args) => handle_list(&store, list_args).await?,
                Commands::Dlq { command } => match command {
                    DlqCommands::List => handle_dlq_list(&store).await?,
                    DlqCommands::Retry { job_id } => handle_dlq_retry(&store, job_id).await?,
                },
                Commands::Config { command } => match command {
                    ConfigCommands::List => handle_config_list(&store).await?,
                    ConfigCommands::Set { key, value } => {
                        handle_config_set(&store, key, value).await?
                    }
                },
                Commands::Log { job_id } => handle_log(&store, job_id).await?,
                Commands::Stats => handle_stats(&store).await?,
                Commands::Worker { .. } | Commands::Serve { .. } => unreachable!(),
            }
        }
    }

    Ok(())
}
