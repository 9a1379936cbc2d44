use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use hashfleet::api::{ErrorResponse, JobResponse, StartFailureResponse};
use hashfleet::config::{
    OrchestratorConfig, ProvisionerConfig, RemoteExecConfig, RetryPolicy, ServerConfig,
};
use hashfleet::node::Node;
use hashfleet::provision::{DockerProvisioner, InstanceId};
use hashfleet::shutdown::install_shutdown_handler;
use hashfleet::worker::{RemoteExecutor, SshTransport, Worker};

#[derive(Parser, Debug)]
#[command(name = "hashfleet")]
#[command(version)]
#[command(about = "Provisions worker fleets for distributed jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the hashfleet server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Run commands on one live instance, stopping at the first failure
    Exec(ExecArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on for HTTP
    #[arg(long, env = "HASHFLEET_PORT", default_value = "8080")]
    port: u16,

    /// Address to bind
    #[arg(long, env = "HASHFLEET_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// JSON file with job records
    #[arg(long, env = "HASHFLEET_RECORDS")]
    records: Option<PathBuf>,

    /// Upper bound on concurrent per-worker operations within one job
    #[arg(long, env = "HASHFLEET_MAX_CONCURRENCY", default_value = "8")]
    max_concurrency: usize,

    /// Command run on every new worker (repeatable, runs in order).
    /// Supports {job_id}, {job_name}, {hash}, {hash_type} and {worker_id}.
    #[arg(long = "startup-command")]
    startup_commands: Vec<String>,

    /// Leave instances that never became ready running instead of terminating them
    #[arg(long)]
    keep_failed_launches: bool,

    #[command(flatten)]
    provision: ProvisionArgs,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Parser, Debug)]
struct ProvisionArgs {
    /// Image workers boot from
    #[arg(long, env = "IMG_ID", default_value = "linuxserver/openssh-server:latest")]
    image: String,

    /// Instance class, "<cpus>x<memory>" (e.g. "2x4g")
    #[arg(long, env = "INST_TYPE")]
    instance_type: Option<String>,

    /// Credential reference installed on workers
    #[arg(long, env = "PEM_NAME")]
    key_name: Option<String>,

    /// Network group workers join
    #[arg(long, env = "SEC_GROUP")]
    network: Option<String>,

    /// Extra environment for workers, KEY=VALUE (repeatable)
    #[arg(long = "instance-env", value_parser = parse_key_value)]
    instance_env: Vec<(String, String)>,

    /// Docker binary
    #[arg(long, env = "HASHFLEET_DOCKER", default_value = "docker")]
    docker_bin: String,

    /// Seconds to wait for a new worker to report running
    #[arg(long, env = "HASHFLEET_READY_TIMEOUT", default_value = "300")]
    ready_timeout_secs: u64,

    /// Seconds between state polls while waiting
    #[arg(
        long,
        env = "HASHFLEET_POLL_INTERVAL",
        default_value = "2",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval_secs: u64,
}

#[derive(Parser, Debug)]
struct RemoteArgs {
    /// Private key for worker logins (PEM format)
    #[arg(long, env = "PEM_PATH", default_value = "worker.pem")]
    key_path: PathBuf,

    /// Login identity on workers
    #[arg(long, env = "HASHFLEET_SSH_USER", default_value = "ubuntu")]
    ssh_user: String,

    /// Remote shell port on workers
    #[arg(long, env = "HASHFLEET_SSH_PORT", default_value = "22")]
    ssh_port: u16,

    /// Connection attempts before giving up
    #[arg(
        long,
        env = "HASHFLEET_CONNECT_ATTEMPTS",
        default_value = "5",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    connect_attempts: u32,

    /// Seconds between connection attempts
    #[arg(long, env = "HASHFLEET_CONNECT_INTERVAL", default_value = "10")]
    connect_interval_secs: u64,

    /// Verify worker host keys against known_hosts
    #[arg(long)]
    strict_host_key_checking: bool,
}

impl ProvisionArgs {
    fn into_config(self) -> ProvisionerConfig {
        ProvisionerConfig {
            image: self.image,
            instance_type: self.instance_type,
            key_name: self.key_name,
            network: self.network,
            env: self.instance_env,
            docker_bin: self.docker_bin,
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }
}

impl RemoteArgs {
    fn into_config(self) -> RemoteExecConfig {
        RemoteExecConfig {
            user: self.ssh_user,
            port: self.ssh_port,
            key_path: self.key_path,
            strict_host_key_checking: self.strict_host_key_checking,
            retry: RetryPolicy {
                max_attempts: self.connect_attempts,
                interval: Duration::from_secs(self.connect_interval_secs),
            },
            ..RemoteExecConfig::default()
        }
    }
}

// =============================================================================
// Exec Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Instance id of the worker
    #[arg(long)]
    instance: String,

    /// Commands to run, in order
    #[arg(required = true, trailing_var_arg = true)]
    commands: Vec<String>,

    #[command(flatten)]
    provision: ProvisionArgs,

    #[command(flatten)]
    remote: RemoteArgs,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', env = "HASHFLEET_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Provision workers for a job record and start it
    Start {
        /// The job ID
        job_id: String,

        /// Leave partially started fleets running instead of tearing them down
        #[arg(long)]
        no_rollback: bool,
    },
    /// Tear down a running job
    Stop {
        /// The job ID
        job_id: String,
    },
    /// Show a running job
    Status {
        /// The job ID
        job_id: String,
    },
    /// List running jobs
    List,
}

#[derive(Serialize)]
struct StartRequest {
    rollback: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn print_job(job: &JobResponse, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => {
            println!("Job ID:    {}", job.id);
            if !job.name.is_empty() {
                println!("Name:      {}", job.name);
            }
            println!("Status:    {}", job.status);
            println!("Workers:   {}/{}", job.workers.len(), job.capacity);
            if job.timelimit_secs > 0 {
                println!("Timelimit: {}s", job.timelimit_secs);
            }
            for worker in &job.workers {
                println!("  {}  (up since {})", worker.id, worker.launched_at);
            }
        }
    }
    Ok(())
}

/// Turn a non-success response into an error carrying the server's message.
async fn error_from(response: reqwest::Response) -> Box<dyn std::error::Error> {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => format!("{}: {}", status, body.error).into(),
        Err(_) => format!("request failed with {}", status).into(),
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let config = ServerConfig {
        listen_addr,
        records_path: args.records,
        provisioner: args.provision.into_config(),
        remote: args.remote.into_config(),
        orchestrator: OrchestratorConfig {
            max_concurrency: args.max_concurrency,
            startup_commands: args.startup_commands,
            terminate_failed_launches: !args.keep_failed_launches,
        },
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        image = %config.provisioner.image,
        instance_type = ?config.provisioner.instance_type,
        network = ?config.provisioner.network,
        max_concurrency = config.orchestrator.max_concurrency,
        startup_commands = config.orchestrator.startup_commands.len(),
        "Starting hashfleet server"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config, shutdown).await?;
    node.run().await
}

async fn run_exec(args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let provisioner = Arc::new(DockerProvisioner::new(args.provision.into_config()));
    let remote = args.remote.into_config();
    let transport = Arc::new(SshTransport::new(&remote));
    let executor = RemoteExecutor::new(provisioner, transport, remote);

    let shutdown = install_shutdown_handler()?;
    let worker = Worker::new(InstanceId::from(args.instance));

    let outputs = executor
        .run_commands(&worker, &args.commands, &shutdown)
        .await?;
    for output in outputs {
        print!("{}", output);
    }
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_start(
    client: &reqwest::Client,
    args: &ClientArgs,
    job_id: &str,
    rollback: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/jobs/{}/start", args.addr, job_id))
        .json(&StartRequest { rollback })
        .send()
        .await?;

    if response.status().is_success() {
        let job: JobResponse = response.json().await?;
        if let OutputFormat::Table = args.output {
            println!("Job started successfully!");
        }
        return print_job(&job, &args.output);
    }

    if response.status() == reqwest::StatusCode::BAD_GATEWAY {
        let failure: StartFailureResponse = response.json().await?;
        match args.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&failure)?),
            OutputFormat::Table => {
                eprintln!("Error: {}", failure.error);
                eprintln!("Failed workers: {}", failure.failures);
                if failure.rolled_back {
                    eprintln!("Started workers were torn down.");
                } else if !failure.workers.is_empty() {
                    eprintln!("Workers left running:");
                    for worker in &failure.workers {
                        eprintln!("  {}", worker);
                    }
                }
                if let Some(e) = failure.rollback_error {
                    eprintln!("Rollback error: {}", e);
                }
            }
        }
        std::process::exit(1);
    }

    Err(error_from(response).await)
}

async fn handle_job_stop(
    client: &reqwest::Client,
    args: &ClientArgs,
    job_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/jobs/{}/stop", args.addr, job_id))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(error_from(response).await);
    }

    let job: JobResponse = response.json().await?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job {} stopped, {} workers terminated", job.id, job.workers.len());
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &reqwest::Client,
    args: &ClientArgs,
    job_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{}/api/jobs/{}", args.addr, job_id))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(error_from(response).await);
    }

    let job: JobResponse = response.json().await?;
    print_job(&job, &args.output)
}

async fn handle_job_list(
    client: &reqwest::Client,
    args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{}/api/jobs", args.addr))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(error_from(response).await);
    }

    let jobs: Vec<JobResponse> = response.json().await?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No running jobs.");
            } else {
                println!("{:<24} {:<10} {:<10} NAME", "JOB ID", "STATUS", "WORKERS");
                println!("{}", "-".repeat(60));
                for job in &jobs {
                    println!(
                        "{:<24} {:<10} {:<10} {}",
                        job.id,
                        job.status,
                        format!("{}/{}", job.workers.len(), job.capacity),
                        job.name
                    );
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
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Exec(exec_args) => {
            run_exec(exec_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();

            match command {
                JobCommands::Start {
                    job_id,
                    no_rollback,
                } => {
                    handle_job_start(&http, &client, &job_id, !no_rollback).await?;
                }
                JobCommands::Stop { job_id } => {
                    handle_job_stop(&http, &client, &job_id).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &client, &job_id).await?;
                }
                JobCommands::List => {
                    handle_job_list(&http, &client).await?;
                }
            }
        }
    }

    Ok(())
}
