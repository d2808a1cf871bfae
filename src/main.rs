use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use clusrun::config::{local_node_name, NodeConfig};
use clusrun::error::ClusrunError;
use clusrun::grpc::client;
use clusrun::headnode::job::{parse_job_ids, JobSpec};
use clusrun::host::{HostAddress, DEFAULT_PORT};
use clusrun::node::Node;
use clusrun::proto::clusnode_client::ClusnodeClient;
use clusrun::proto::headnode_client::HeadnodeClient;
use clusrun::proto::{
    CancelClusJobsRequest, Empty, GetJobsRequest, GetNodesRequest, JobInfo, JobState, NodeState,
    SetConfigsRequest, SetHeadnodesMode, SetHeadnodesRequest, SetNodeGroupsRequest,
    StartClusJobRequest,
};
use clusrun::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "clusrun")]
#[command(version)]
#[command(about = "Run shell commands across a self-registering set of cluster nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a node serving both the headnode and the clusnode role
    Start(StartArgs),

    /// List the nodes reporting to a headnode
    Node {
        #[command(flatten)]
        client: ClientArgs,

        /// Regex the node name should match
        #[arg(long, short = 'p', default_value = "")]
        pattern: String,

        /// Only list nodes in this state
        #[arg(long, short = 's')]
        state: Option<StateArg>,

        /// Only list nodes in these groups
        #[arg(long, short = 'g', value_delimiter = ',')]
        groups: Vec<String>,

        /// Require membership in every group instead of any
        #[arg(long)]
        intersect: bool,
    },

    /// Run a command on nodes and print their output
    Run {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Per-node substitution, e.g. "{i}{0-9}" or "%x{10,-1}"
        #[arg(long, default_value = "")]
        sweep: String,

        /// Job name
        #[arg(long, default_value = "")]
        name: String,

        /// Run the contents of this file; trailing words become its arguments
        #[arg(long)]
        script: Option<PathBuf>,

        /// Command line to run
        #[arg(
            required_unless_present = "script",
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        command: Vec<String>,
    },

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Node group management commands
    Group {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: GroupCommands,
    },

    /// Change the headnodes a clusnode reports to
    Headnodes {
        /// Clusnode to configure
        #[arg(long, short = 'c', default_value = "localhost")]
        clusnode: String,

        #[arg(value_enum)]
        mode: ModeArg,

        /// Headnode hosts
        #[arg(required = true)]
        headnodes: Vec<String>,
    },

    /// Read or change runtime settings
    Config {
        /// Node to configure
        #[arg(long, short = 'n', default_value = "localhost")]
        node: String,

        /// Role whose settings are read or written
        #[arg(long, short = 'r', value_enum, default_value = "headnode")]
        role: RoleArg,

        /// Settings to change, as `name=value`
        settings: Vec<String>,
    },
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Name to report, defaults to the OS hostname
    #[arg(long)]
    name: Option<String>,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Host other nodes dial to reach this node, defaults to NAME:PORT
    #[arg(long)]
    host: Option<String>,

    /// Headnodes to report to (comma-separated)
    #[arg(long, value_delimiter = ',')]
    headnodes: Vec<String>,

    /// Directory for jobs, groups and output, defaults to <executable>.db
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Headnode to connect to
    #[arg(long = "headnode", short = 'H', default_value = "localhost")]
    headnode: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct TargetArgs {
    /// Regex the node name should match
    #[arg(long, short = 'p', default_value = "")]
    pattern: String,

    /// Run on nodes in these groups
    #[arg(long, short = 'g', value_delimiter = ',')]
    groups: Vec<String>,

    /// Require membership in every group instead of any
    #[arg(long)]
    intersect: bool,

    /// Run on exactly these nodes (comma-separated)
    #[arg(long, short = 'n', value_delimiter = ',')]
    nodes: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Ready,
    Error,
    Lost,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Headnode,
    Clusnode,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// List jobs, all of them when no id is given
    List {
        /// Job ids: `3`, `1-5`, `-1` (latest), `last`, `all`
        ids: Vec<String>,
    },
    /// Cancel jobs
    Cancel {
        /// Job ids: `3`, `1-5`, `-1` (latest), `last`, `all`
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Run a stored job again on the same nodes
    Rerun {
        /// Job id, `-1` or `last` for the latest
        id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum GroupCommands {
    /// Add nodes to groups
    Add {
        #[arg(long, short = 'g', value_delimiter = ',', required = true)]
        groups: Vec<String>,
        #[arg(long, short = 'n', value_delimiter = ',', required = true)]
        nodes: Vec<String>,
    },
    /// Remove nodes from groups
    Remove {
        #[arg(long, short = 'g', value_delimiter = ',', required = true)]
        groups: Vec<String>,
        #[arg(long, short = 'n', value_delimiter = ',', required = true)]
        nodes: Vec<String>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeOutput {
    name: String,
    state: String,
    groups: Vec<String>,
}

#[derive(Serialize)]
struct JobOutput {
    id: i32,
    name: String,
    state: String,
    command: String,
    arguments: Vec<String>,
    sweep: String,
    nodes: Vec<String>,
    failed_nodes: BTreeMap<String, i32>,
    cancel_failed_nodes: Vec<String>,
    create_time: i64,
    end_time: i64,
}

impl From<JobInfo> for JobOutput {
    fn from(job: JobInfo) -> Self {
        Self {
            id: job.id,
            name: job.name,
            state: job_state_to_string(job.state),
            command: job.command,
            arguments: job.arguments,
            sweep: job.sweep,
            nodes: job.nodes,
            failed_nodes: job.failed_nodes.into_iter().collect(),
            cancel_failed_nodes: job.cancel_failed_nodes,
            create_time: job.create_time,
            end_time: job.end_time,
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn job_state_to_string(state: i32) -> String {
    match JobState::try_from(state) {
        Ok(JobState::Created) => "Created",
        Ok(JobState::Dispatching) => "Dispatching",
        Ok(JobState::Running) => "Running",
        Ok(JobState::Canceling) => "Canceling",
        Ok(JobState::Finished) => "Finished",
        Ok(JobState::Failed) => "Failed",
        Ok(JobState::Canceled) => "Canceled",
        Ok(JobState::CancelFailed) => "CancelFailed",
        _ => "Unknown",
    }
    .to_string()
}

fn node_state_to_string(state: i32) -> String {
    match NodeState::try_from(state) {
        Ok(NodeState::Ready) => "Ready",
        Ok(NodeState::Error) => "Error",
        Ok(NodeState::Lost) => "Lost",
        _ => "Unknown",
    }
    .to_string()
}

async fn connect(host: &str) -> Result<Channel, Box<dyn std::error::Error>> {
    let address = HostAddress::parse(host, &local_node_name()?)?;
    Ok(client::connect(&address.to_string()).await?)
}

fn parse_settings(settings: &[String]) -> Result<HashMap<String, String>, ClusrunError> {
    settings
        .iter()
        .map(|s| match s.split_once('=') {
            Some((k, v)) => Ok((k.trim().to_string(), v.trim().to_string())),
            None => Err(ClusrunError::InvalidArgument(format!(
                "Setting should be name=value: {:?}",
                s
            ))),
        })
        .collect()
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let exe = std::env::current_exe()?;
    let node_name = match args.name {
        Some(name) => name,
        None => local_node_name()?,
    };
    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from(format!("{}.db", exe.display())));

    let mut config = NodeConfig::new(&node_name, args.port, data_dir)?;
    config.config_file = PathBuf::from(format!("{}.config", exe.display()));
    config.lock_file = exe;
    if let Some(host) = args.host {
        config = config.with_host(HostAddress::parse(&host, &node_name)?);
    }
    for headnode in &args.headnodes {
        config = config.with_headnode(headnode);
    }

    tracing::info!(
        node = %config.node_name,
        host = %config.host,
        listen_addr = %config.listen_addr,
        headnodes = ?config.headnodes,
        "Starting clusrun node"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config, shutdown)?;
    node.run().await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_node_list(
    client: &mut HeadnodeClient<Channel>,
    request: GetNodesRequest,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes: Vec<NodeOutput> = client
        .get_nodes(request)
        .await?
        .into_inner()
        .nodes
        .into_iter()
        .map(|n| NodeOutput {
            name: n.name,
            state: node_state_to_string(n.state),
            groups: n.groups,
        })
        .collect();

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&nodes)?),
        OutputFormat::Table => {
            if nodes.is_empty() {
                println!("No nodes found.");
                return Ok(());
            }
            println!("{:<40} {:<8} GROUPS", "NODE", "STATE");
            println!("{}", "-".repeat(60));
            for node in &nodes {
                println!("{:<40} {:<8} {}", node.name, node.state, node.groups.join(","));
            }
            println!();
            println!("{} nodes", nodes.len());
        }
    }
    Ok(())
}

/// Submit a job and print every node's output as it arrives.
///
/// Returns false if any node exited non-zero.
async fn handle_run(
    client: &mut HeadnodeClient<Channel>,
    request: StartClusJobRequest,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut stream = client.start_clus_job(request).await?.into_inner();
    let mut exit_codes: BTreeMap<String, i32> = BTreeMap::new();

    while let Some(frame) = stream.next().await {
        let frame = frame?;
        if frame.node.is_empty() {
            println!("Job {} started on {} node(s): {}", frame.job_id, frame.nodes.len(), frame.nodes.join(", "));
            continue;
        }
        for line in frame.stdout.lines() {
            println!("[{}]: {}", frame.node, line);
        }
        for line in frame.stderr.lines() {
            eprintln!("[{}]: {}", frame.node, line);
        }
        if let Some(code) = frame.exit_code {
            exit_codes.insert(frame.node, code);
        }
    }

    let failed: Vec<_> = exit_codes.iter().filter(|(_, code)| **code != 0).collect();
    println!();
    println!(
        "{} node(s) succeeded, {} node(s) failed",
        exit_codes.len() - failed.len(),
        failed.len()
    );
    for (node, code) in &failed {
        println!("  {} exited with {}", node, code);
    }
    Ok(failed.is_empty())
}

async fn handle_job_list(
    client: &mut HeadnodeClient<Channel>,
    ids: Vec<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_ids = parse_job_ids(&ids)?.into_iter().collect();
    let jobs: Vec<JobOutput> = client
        .get_jobs(GetJobsRequest { job_ids })
        .await?
        .into_inner()
        .jobs
        .into_iter()
        .map(JobOutput::from)
        .collect();

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<6} {:<13} {:<6} COMMAND", "ID", "STATE", "NODES");
            println!("{}", "-".repeat(60));
            for job in &jobs {
                let command = if job.command.len() > 30 {
                    format!("{}...", job.command.chars().take(27).collect::<String>())
                } else {
                    job.command.clone()
                };
                println!("{:<6} {:<13} {:<6} {}", job.id, job.state, job.nodes.len(), command);
                for (node, code) in &job.failed_nodes {
                    println!("       failed: {} ({})", node, code);
                }
                if !job.cancel_failed_nodes.is_empty() {
                    println!("       cancel failed: {}", job.cancel_failed_nodes.join(", "));
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    client: &mut HeadnodeClient<Channel>,
    ids: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_ids = parse_job_ids(&ids)?.into_iter().collect();
    let result = client
        .cancel_clus_jobs(CancelClusJobsRequest { job_ids })
        .await?
        .into_inner()
        .result;
    if result.is_empty() {
        println!("No job is cancelled.");
        return Ok(());
    }
    let sorted: BTreeMap<i32, i32> = result.into_iter().collect();
    for (id, state) in sorted {
        println!("Job {}: {}", id, job_state_to_string(state));
    }
    Ok(())
}

async fn handle_job_rerun(
    client: &mut HeadnodeClient<Channel>,
    id: String,
) -> Result<bool, Box<dyn std::error::Error>> {
    let job_ids = parse_job_ids(&[id])?.into_iter().collect();
    let jobs = client
        .get_jobs(GetJobsRequest { job_ids })
        .await?
        .into_inner()
        .jobs;
    let [job] = jobs.as_slice() else {
        return Err("Expected exactly one job to rerun".into());
    };
    let request = StartClusJobRequest {
        command: job.command.clone(),
        arguments: job.arguments.clone(),
        sweep: job.sweep.clone(),
        nodes: job.nodes.clone(),
        name: job.name.clone(),
        ..Default::default()
    };
    handle_run(client, request).await
}

async fn handle_config(
    node: &str,
    role: RoleArg,
    settings: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let channel = connect(node).await?;
    let configs = parse_settings(settings)?;
    let result: BTreeMap<String, String> = match (role, configs.is_empty()) {
        (RoleArg::Headnode, true) => HeadnodeClient::new(channel)
            .get_configs(Empty {})
            .await?
            .into_inner()
            .configs
            .into_iter()
            .collect(),
        (RoleArg::Headnode, false) => HeadnodeClient::new(channel)
            .set_configs(SetConfigsRequest { configs })
            .await?
            .into_inner()
            .results
            .into_iter()
            .collect(),
        (RoleArg::Clusnode, true) => ClusnodeClient::new(channel)
            .get_configs(Empty {})
            .await?
            .into_inner()
            .configs
            .into_iter()
            .collect(),
        (RoleArg::Clusnode, false) => ClusnodeClient::new(channel)
            .set_configs(SetConfigsRequest { configs })
            .await?
            .into_inner()
            .results
            .into_iter()
            .collect(),
    };
    for (key, value) in result {
        println!("{}: {}", key, value);
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
        Commands::Start(start_args) => {
            run_server(start_args).await?;
        }
        Commands::Node {
            client,
            pattern,
            state,
            groups,
            intersect,
        } => {
            let mut grpc_client = HeadnodeClient::new(connect(&client.headnode).await?);
            let state = match state {
                Some(StateArg::Ready) => NodeState::Ready,
                Some(StateArg::Error) => NodeState::Error,
                Some(StateArg::Lost) => NodeState::Lost,
                None => NodeState::Unknown,
            };
            let request = GetNodesRequest {
                pattern,
                state: state as i32,
                groups,
                intersect,
            };
            handle_node_list(&mut grpc_client, request, &client.output).await?;
        }
        Commands::Run {
            client,
            target,
            sweep,
            name,
            script,
            command,
        } => {
            let script = match script {
                Some(path) => Some(std::fs::read_to_string(&path).map_err(|e| {
                    format!("Failed to read script {}: {}", path.display(), e)
                })?),
                None => None,
            };
            let spec = JobSpec::default().with_command_line(command, script);
            let mut grpc_client = HeadnodeClient::new(connect(&client.headnode).await?);
            let request = StartClusJobRequest {
                command: spec.command,
                arguments: spec.arguments,
                sweep,
                pattern: target.pattern,
                groups: target.groups,
                intersect: target.intersect,
                nodes: target.nodes,
                name,
            };
            if !handle_run(&mut grpc_client, request).await? {
                std::process::exit(1);
            }
        }
        Commands::Job { client, command } => {
            let mut grpc_client = HeadnodeClient::new(connect(&client.headnode).await?);
            match command {
                JobCommands::List { ids } => {
                    handle_job_list(&mut grpc_client, ids, &client.output).await?;
                }
                JobCommands::Cancel { ids } => {
                    handle_job_cancel(&mut grpc_client, ids).await?;
                }
                JobCommands::Rerun { id } => {
                    if !handle_job_rerun(&mut grpc_client, id).await? {
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Group { client, command } => {
            let mut grpc_client = HeadnodeClient::new(connect(&client.headnode).await?);
            let (groups, nodes, remove) = match command {
                GroupCommands::Add { groups, nodes } => (groups, nodes, false),
                GroupCommands::Remove { groups, nodes } => (groups, nodes, true),
            };
            grpc_client
                .set_node_groups(SetNodeGroupsRequest {
                    groups,
                    nodes,
                    remove,
                })
                .await?;
            println!("Node groups updated.");
        }
        Commands::Headnodes {
            clusnode,
            mode,
            headnodes,
        } => {
            let mut grpc_client = ClusnodeClient::new(connect(&clusnode).await?);
            let mode = match mode {
                ModeArg::Add => SetHeadnodesMode::Add,
                ModeArg::Replace => SetHeadnodesMode::Replace,
                ModeArg::Remove => SetHeadnodesMode::Remove,
            };
            let results: BTreeMap<String, String> = grpc_client
                .set_headnodes(SetHeadnodesRequest {
                    headnodes,
                    mode: mode as i32,
                })
                .await?
                .into_inner()
                .results
                .into_iter()
                .collect();
            for (headnode, result) in results {
                println!("{}: {}", headnode, result);
            }
        }
        Commands::Config {
            node,
            role,
            settings,
        } => {
            handle_config(&node, role, &settings).await?;
        }
    }

    Ok(())
}
