//! The `knitfab-k8s` command line tool.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use clap_verbosity_flag::WarnLevel;
use futures::StreamExt as _;
use knitfab_cluster::Cluster;
use knitfab_cluster::Handle as _;
use knitfab_cluster::KubeApiClient;
use knitfab_domain::ClusterConfig;
use knitfab_domain::DEFAULT_CLUSTER_DOMAIN;
use knitfab_domain::DataAgent;
use knitfab_domain::DataAgentConfig;
use knitfab_domain::DataAgentMode;
use knitfab_domain::InitConfig;
use knitfab_domain::KnitDataBody;
use knitfab_domain::NurseConfig;
use knitfab_domain::PlanBody;
use knitfab_domain::RunBody;
use knitfab_domain::VolumeConfig;
use knitfab_domain::WorkerConfig;
use knitfab_workloads::Workloads;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_log::AsTrace as _;
use tracing_subscriber::EnvFilter;

/// Operates Knitfab data agents and workers on a Kubernetes cluster.
#[derive(Parser)]
#[command(name = "knitfab-k8s")]
pub struct Cli {
    /// The cluster settings.
    #[command(flatten)]
    cluster: ClusterArgs,

    /// The verbosity level.
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    /// The command to run.
    #[command(subcommand)]
    command: Command,
}

/// The cluster settings.
#[derive(Args)]
struct ClusterArgs {
    /// The Kubernetes namespace Knitfab resources live in.
    #[clap(long, env = "KNITFAB_NAMESPACE", global = true, default_value = "knitfab")]
    namespace: String,

    /// The cluster domain used to address services.
    #[clap(long, env = "KNITFAB_CLUSTER_DOMAIN", global = true, default_value = DEFAULT_CLUSTER_DOMAIN)]
    domain: String,

    /// The data agent image.
    #[clap(
        long,
        env = "KNITFAB_DATAAGT_IMAGE",
        global = true,
        default_value = "ghcr.io/opst/knitfab/knit-dataagt:latest"
    )]
    dataagt_image: String,

    /// The port data agents serve on.
    #[clap(long, env = "KNITFAB_DATAAGT_PORT", global = true, default_value_t = 8080)]
    dataagt_port: i32,

    /// The storage class of data volumes.
    #[clap(
        long,
        env = "KNITFAB_STORAGE_CLASS",
        global = true,
        default_value = "knit-storage-nfs"
    )]
    storage_class: String,

    /// The capacity requested for new data volumes.
    #[clap(long, env = "KNITFAB_INITIAL_CAPACITY", global = true, default_value = "1Gi")]
    initial_capacity: String,

    /// The priority class of worker pods.
    #[clap(long, env = "KNITFAB_WORKER_PRIORITY", global = true)]
    worker_priority: Option<String>,

    /// The image preparing the mount paths of workers.
    #[clap(
        long,
        env = "KNITFAB_INIT_IMAGE",
        global = true,
        default_value = "ghcr.io/opst/knitfab/knit-empty:latest"
    )]
    init_image: String,

    /// The image recording the logs of workers.
    #[clap(
        long,
        env = "KNITFAB_NURSE_IMAGE",
        global = true,
        default_value = "ghcr.io/opst/knitfab/knit-nurse:latest"
    )]
    nurse_image: String,

    /// The secret holding the service account token of the log recorder.
    #[clap(
        long,
        env = "KNITFAB_NURSE_SECRET",
        global = true,
        default_value = "knit-nurse-token"
    )]
    nurse_secret: String,
}

impl ClusterArgs {
    /// Builds the cluster configuration.
    fn config(&self) -> ClusterConfig {
        ClusterConfig::builder()
            .namespace(&self.namespace)
            .domain(&self.domain)
            .data_agent(
                DataAgentConfig::builder()
                    .image(&self.dataagt_image)
                    .port(self.dataagt_port)
                    .volume(
                        VolumeConfig::builder()
                            .storage_class_name(&self.storage_class)
                            .initial_capacity(&self.initial_capacity)
                            .build(),
                    )
                    .build(),
            )
            .worker(
                WorkerConfig::builder()
                    .maybe_priority(self.worker_priority.clone())
                    .init(InitConfig::builder().image(&self.init_image).build())
                    .nurse(
                        NurseConfig::builder()
                            .image(&self.nurse_image)
                            .service_account_secret(&self.nurse_secret)
                            .build(),
                    )
                    .build(),
            )
            .build()
    }

    /// Connects to the cluster.
    async fn workloads(&self) -> Result<Workloads> {
        let config = self.config();
        let client = KubeApiClient::try_default().await?;
        let cluster = Cluster::new(Arc::new(client), &config.namespace, &config.domain);
        Ok(Workloads::new(cluster, Arc::new(config)))
    }
}

/// A command of the tool.
#[derive(Subcommand)]
enum Command {
    /// Manages data agents.
    #[command(subcommand)]
    DataAgent(DataAgentCommand),

    /// Inspects data volumes.
    #[command(subcommand)]
    Data(DataCommand),

    /// Manages workers.
    #[command(subcommand)]
    Worker(WorkerCommand),
}

/// A data agent command.
#[derive(Subcommand)]
enum DataAgentCommand {
    /// Spawns a data agent and serves until a termination signal.
    Spawn {
        /// The data agent.
        #[command(flatten)]
        agent: AgentArgs,

        /// How long the agent may take to be scheduled, in seconds.
        #[clap(long, default_value_t = 300)]
        pending_timeout: u64,
    },

    /// Finds a running data agent.
    Find {
        /// The data agent.
        #[command(flatten)]
        agent: AgentArgs,
    },
}

/// Identifies a data agent.
#[derive(Args)]
struct AgentArgs {
    /// The name of the data agent.
    #[clap(long)]
    name: String,

    /// The mode of the data agent (`read` or `write`).
    #[clap(long)]
    mode: DataAgentMode,

    /// The data served by the agent.
    #[command(flatten)]
    data: DataArgs,
}

impl From<AgentArgs> for DataAgent {
    fn from(args: AgentArgs) -> Self {
        Self {
            name: args.name,
            mode: args.mode,
            data: args.data.into(),
        }
    }
}

/// A data command.
#[derive(Subcommand)]
enum DataCommand {
    /// Determines if the volume of a piece of data is bound.
    Bound {
        /// The data.
        #[command(flatten)]
        data: DataArgs,
    },
}

/// Identifies a piece of data.
#[derive(Args)]
struct DataArgs {
    /// The knit id of the data.
    #[clap(long)]
    knit_id: String,

    /// The name of the data's persistent volume claim.
    #[clap(long)]
    volume_ref: String,
}

impl From<DataArgs> for KnitDataBody {
    fn from(args: DataArgs) -> Self {
        Self::new(args.knit_id, args.volume_ref)
    }
}

/// A worker command.
#[derive(Subcommand)]
enum WorkerCommand {
    /// Prints the status of a worker.
    Status(RunArgs),

    /// Follows the log of a worker.
    Log(RunArgs),

    /// Deletes a worker.
    Close(RunArgs),
}

impl WorkerCommand {
    /// Gets the run the command applies to.
    fn run(&self) -> &RunArgs {
        match self {
            Self::Status(run) | Self::Log(run) | Self::Close(run) => run,
        }
    }
}

/// Identifies a run.
#[derive(Args, Clone)]
struct RunArgs {
    /// The id of the run.
    #[clap(long)]
    run_id: String,

    /// The name of the run's worker.
    #[clap(long)]
    worker_name: String,
}

impl From<RunArgs> for RunBody {
    fn from(args: RunArgs) -> Self {
        Self {
            id: args.run_id,
            worker_name: args.worker_name,
            plan: PlanBody::default(),
        }
    }
}

/// Waits for the signal that stops a served data agent.
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn stop_signal() -> &'static str {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler should install");
    let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler should install");
    tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    }
}

/// Waits for the signal that stops a served data agent.
///
/// Returns the name of the signal received.
#[cfg(windows)]
async fn stop_signal() -> &'static str {
    let mut ctrl_c = tokio::signal::windows::ctrl_c().expect("Ctrl-C handler should install");
    ctrl_c.recv().await;
    "Ctrl-C"
}

/// Runs a data agent command.
async fn data_agent(workloads: &Workloads, command: DataAgentCommand) -> Result<()> {
    let token = CancellationToken::new();
    match command {
        DataAgentCommand::Spawn {
            agent,
            pending_timeout,
        } => {
            let request = DataAgent::from(agent);
            let deadline = Instant::now() + Duration::from_secs(pending_timeout);

            tokio::spawn({
                let token = token.clone();
                let name = request.name.clone();
                async move {
                    let signal = stop_signal().await;
                    info!("received {signal}: stopping data agent `{name}`");
                    token.cancel();
                }
            });

            let agent = workloads
                .spawn_data_agent(&token, &request, deadline)
                .await
                .with_context(|| format!("failed to spawn data agent `{name}`", name = request.name))?;

            info!("spawned {agent}");
            println!("{url}", url = agent.url());

            token.cancelled().await;
            agent
                .close()
                .await
                .with_context(|| format!("failed to close {agent}"))
        }
        DataAgentCommand::Find { agent } => {
            let request = DataAgent::from(agent);
            let agent = workloads
                .find_data_agent(&token, &request)
                .await
                .with_context(|| format!("failed to find data agent `{name}`", name = request.name))?;

            println!("{url}\t{phase}", url = agent.url(), phase = agent.pod_phase());
            Ok(())
        }
    }
}

/// Runs a data command.
async fn data(workloads: &Workloads, command: DataCommand) -> Result<()> {
    match command {
        DataCommand::Bound { data } => {
            let body = KnitDataBody::from(data);
            let bound = workloads
                .check_data_is_bound(&CancellationToken::new(), &body)
                .await
                .with_context(|| {
                    format!(
                        "failed to check the volume `{name}` of data `{knit_id}`",
                        name = body.volume_ref,
                        knit_id = body.knit_id
                    )
                })?;

            println!("{bound}");
            Ok(())
        }
    }
}

/// Runs a worker command.
async fn worker(workloads: &Workloads, command: WorkerCommand) -> Result<()> {
    let run = RunBody::from(command.run().clone());
    let worker = workloads
        .find_worker(&CancellationToken::new(), &run)
        .await
        .with_context(|| format!("failed to find the worker of run `{id}`", id = run.id))?;

    match command {
        WorkerCommand::Status(_) => {
            println!("{status}", status = worker.job_status().await);
        }
        WorkerCommand::Log(_) => {
            let mut lines = worker
                .log()
                .await
                .with_context(|| format!("failed to follow the log of run `{id}`", id = run.id))?;

            while let Some(line) = lines.next().await {
                println!("{line}", line = line.context("failed to read log")?);
            }
        }
        WorkerCommand::Close(_) => {
            worker
                .close()
                .await
                .with_context(|| format!("failed to close the worker of run `{id}`", id = run.id))?;
            info!("closed worker `{name}`", name = worker.name());
        }
    }

    Ok(())
}

/// Installs the log subscriber.
///
/// Logs go to stderr; stdout carries command output. Without `RUST_LOG`,
/// the verbosity flags apply to the Knitfab crates and other crates report
/// at most warnings.
fn init_logging(verbose: &Verbosity<WarnLevel>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(log_directives(verbose.log_level_filter().as_trace()))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

/// Gets the log directives for a verbosity level.
fn log_directives(level: LevelFilter) -> String {
    let others = level.min(LevelFilter::WARN);
    format!("{others},knitfab={level},knitfab_cluster={level},knitfab_workloads={level}")
}

/// The main method.
#[tokio::main]
pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.verbose);

    let workloads = cli.cluster.workloads().await?;
    match cli.command {
        Command::DataAgent(command) => data_agent(&workloads, command).await,
        Command::Data(command) => data(&workloads, command).await,
        Command::Worker(command) => worker(&workloads, command).await,
    }
}
