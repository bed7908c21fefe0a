use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use jobfleet::clock::TokioClock;
use jobfleet::config::{WorkerConfig, WorkerIdentity};
use jobfleet::controller::JobPoster;
use jobfleet::ids::UuidIds;
use jobfleet::protocol::{decode_status, BatchId, JobSpec, StatusMessage};
use jobfleet::provision::LocalHost;
use jobfleet::queue::{MessageQueue, SpoolQueue};
use jobfleet::shutdown::install_shutdown_handler;
use jobfleet::store::{BucketPath, DirObjectStore};
use jobfleet::worker::{LocalLauncher, Worker, WorkerExit, WorkerServices};

const JOB_QUEUE_DIR: &str = "jobs";
const STATUS_QUEUE_DIR: &str = "status";

#[derive(Parser, Debug)]
#[command(name = "jobfleet")]
#[command(version)]
#[command(about = "Distribute shell jobs to a fleet of workers through message queues")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a Worker on this host
    Worker(WorkerArgs),

    /// Post one job to the job queue
    Submit(SubmitArgs),

    /// Drain the status queue and print what the Workers reported
    Status(StatusArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SpoolArgs {
    /// Directory holding the job and status queues
    #[arg(long, env = "JOBFLEET_SPOOL")]
    spool: PathBuf,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    spool: SpoolArgs,

    /// Directory standing in for the object store
    #[arg(long, env = "JOBFLEET_STORE")]
    store: PathBuf,

    /// Bucket and optional prefix logs are uploaded under ("bucket/prefix")
    #[arg(long, env = "JOBFLEET_BUCKET")]
    bucket: String,

    /// Directory for the per-job log files (defaults to the system temp dir)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Terminate this host once the job queue stays empty
    #[arg(long)]
    quit_when_empty: bool,

    /// Command run to terminate this host, comma separated (e.g. "sudo,shutdown,-h,now")
    #[arg(long, value_delimiter = ',')]
    shutdown_command: Vec<String>,

    /// Seconds between polling cycles
    #[arg(long, default_value = "60")]
    cycle_interval: u64,

    /// Seconds a single job queue receive may wait
    #[arg(long, default_value = "5")]
    receive_wait: u64,

    /// Seconds the queue must stay empty before quitting
    #[arg(long, default_value = "30")]
    idle_timeout: u64,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    spool: SpoolArgs,

    /// Batch id to tag the job with (random when omitted)
    #[arg(long)]
    batch_id: Option<String>,

    /// CPUs the job needs
    #[arg(long, default_value = "1")]
    cpus: u32,

    /// Expected runtime in seconds
    #[arg(long)]
    expected_runtime: Option<i64>,

    /// Log file name template, "%d" is replaced by the job id
    #[arg(long)]
    log_file: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// The command to run, e.g. "-- sh -c 'echo hello'"
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    #[command(flatten)]
    spool: SpoolArgs,

    /// Seconds to wait for the first status message
    #[arg(long, default_value = "0")]
    wait: u64,

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
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    batch_id: String,
    log_file: String,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    batch_id: String,
    instance: String,
    status: String,
    ret_code: Option<i32>,
    started_on: String,
    last_update: String,
    local_log_file: String,
}

impl From<&StatusMessage> for JobStatusOutput {
    fn from(status: &StatusMessage) -> Self {
        Self {
            job_id: status.job.id().to_string(),
            batch_id: status.job.batch_id().to_string(),
            instance: status.instance.clone(),
            status: status.state.to_string(),
            ret_code: status.ret_code(),
            started_on: status.started_on.to_rfc3339(),
            last_update: status.last_update.to_rfc3339(),
            local_log_file: status.local_log_file.display().to_string(),
        }
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn open_queue(spool: &Path, dir: &str) -> Result<Arc<SpoolQueue>, Box<dyn std::error::Error>> {
    Ok(Arc::new(SpoolQueue::open(spool.join(dir)).await?))
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let identity = WorkerIdentity::from_env()?;
    let bucket = BucketPath::parse(&args.bucket)?;
    let mut config = WorkerConfig::new(identity, bucket)
        .with_quit_when_empty(args.quit_when_empty)
        .with_intervals(
            Duration::from_secs(args.cycle_interval),
            Duration::from_secs(args.receive_wait),
            Duration::from_secs(args.idle_timeout),
        );
    if let Some(dir) = args.output_dir {
        config = config.with_output_dir(dir);
    }

    tokio::fs::create_dir_all(&args.store).await?;
    let services = WorkerServices {
        job_queue: open_queue(&args.spool.spool, JOB_QUEUE_DIR).await?,
        status_queue: open_queue(&args.spool.spool, STATUS_QUEUE_DIR).await?,
        store: Arc::new(DirObjectStore::new(args.store)),
        provisioner: Arc::new(LocalHost::new().with_shutdown_command(args.shutdown_command)),
        launcher: Arc::new(LocalLauncher),
        clock: Arc::new(TokioClock),
    };

    let shutdown = install_shutdown_handler()?;
    let mut worker = Worker::new(config, services)?;
    match worker.run(shutdown).await? {
        WorkerExit::Drained => tracing::info!("Worker finished, job queue drained"),
        WorkerExit::Cancelled => tracing::info!("Worker stopped"),
    }
    Ok(())
}

async fn handle_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut spec = JobSpec::new(args.command)?.with_num_cpus(args.cpus)?;
    if let Some(secs) = args.expected_runtime {
        spec = spec.with_expected_runtime(secs);
    }
    if let Some(template) = args.log_file {
        spec = spec.with_log_file_template(template)?;
    }

    let job_queue = open_queue(&args.spool.spool, JOB_QUEUE_DIR).await?;
    let poster = JobPoster::new(job_queue, Arc::new(UuidIds));
    let job = poster.add_job(spec, args.batch_id.map(BatchId::new)).await?;

    match args.output {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: job.id().to_string(),
                batch_id: job.batch_id().to_string(),
                log_file: job.log_file_name(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID:   {}", job.id());
            println!("Batch ID: {}", job.batch_id());
        }
    }
    Ok(())
}

async fn handle_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let status_queue = open_queue(&args.spool.spool, STATUS_QUEUE_DIR).await?;

    let mut statuses = Vec::new();
    let mut wait = Duration::from_secs(args.wait);
    while let Some(message) = status_queue.receive(wait).await? {
        wait = Duration::ZERO;
        match decode_status(&message.body) {
            Ok(status) => statuses.push(status),
            Err(e) => {
                tracing::warn!(handle = %message.handle, error = %e, "Discarding malformed status message")
            }
        }
    }

    let rows: Vec<JobStatusOutput> = statuses.iter().map(JobStatusOutput::from).collect();
    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("No status messages.");
                return Ok(());
            }
            println!(
                "{:<34} {:<12} {:<20} {:<10} {:<5} LAST UPDATE",
                "JOB ID", "BATCH", "INSTANCE", "STATUS", "CODE"
            );
            println!("{}", "-".repeat(110));
            for row in &rows {
                let code = row
                    .ret_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<34} {:<12} {:<20} {:<10} {:<5} {}",
                    row.job_id, row.batch_id, row.instance, row.status, code, row.last_update
                );
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

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Submit(submit_args) => handle_submit(submit_args).await?,
        Commands::Status(status_args) => handle_status(status_args).await?,
    }

    Ok(())
}
