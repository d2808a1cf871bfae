//! Job orchestration: node resolution, fan-out, output relay and cancellation.
//!
//! A submitted job is resolved against the live, validated nodes, stored,
//! then run on every node concurrently. Each node's output is relayed to the
//! submitter as it arrives and optionally mirrored to the job's output
//! directory. The job is finalized only after every node task has joined.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tonic::Status;

use crate::config::Settings;
use crate::error::{ClusrunError, Result};
use crate::grpc::client;
use crate::headnode::groups::NodeGroups;
use crate::headnode::job::{Job, JobSpec, JobState};
use crate::headnode::liveness::NodeLiveness;
use crate::headnode::store::JobStore;
use crate::headnode::sweep::parse_sweep;
use crate::host::{host_of_display_name, HostAddress};
use crate::proto;
use crate::proto::clusnode_client::ClusnodeClient;

/// Exit code recorded for a node that could not be reached or whose stream broke.
pub const EXIT_UNREACHABLE: i32 = -1;

const RELAY_BUFFER: usize = 64;

pub type ReplySender = mpsc::Sender<std::result::Result<proto::StartClusJobReply, Status>>;
pub type ReplyReceiver = mpsc::Receiver<std::result::Result<proto::StartClusJobReply, Status>>;

pub struct Dispatcher {
    headnode: HostAddress,
    store: Arc<JobStore>,
    liveness: Arc<NodeLiveness>,
    groups: Arc<NodeGroups>,
    settings: Arc<Settings>,
}

impl Dispatcher {
    pub fn new(
        headnode: HostAddress,
        store: Arc<JobStore>,
        liveness: Arc<NodeLiveness>,
        groups: Arc<NodeGroups>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            headnode,
            store,
            liveness,
            groups,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Resolve the target nodes of `spec`.
    ///
    /// Explicit nodes must each name a ready node, by display name or by
    /// host. Otherwise every ready node matching the pattern and, when groups
    /// are given, the group union (or intersection) is selected.
    pub fn resolve_nodes(&self, spec: &JobSpec, intersect: bool) -> Result<Vec<String>> {
        let ready = self.liveness.ready_nodes();

        let nodes = if spec.specified_nodes.is_empty() {
            let pattern = Regex::new(&spec.node_pattern).map_err(|e| {
                ClusrunError::InvalidArgument(format!(
                    "Invalid node pattern {:?}: {}",
                    spec.node_pattern, e
                ))
            })?;
            let members = self.groups.members(&spec.node_groups, intersect);
            ready
                .into_iter()
                .filter(|n| pattern.is_match(n))
                .filter(|n| members.as_ref().map_or(true, |m| m.contains(n)))
                .collect()
        } else {
            let mut by_name = HashMap::new();
            for node in &ready {
                by_name.insert(node.clone(), node.clone());
                by_name.insert(host_of_display_name(node), node.clone());
            }

            let mut resolved = Vec::new();
            let mut seen = BTreeSet::new();
            let mut invalid = Vec::new();
            for requested in &spec.specified_nodes {
                let key = requested.trim().to_uppercase();
                if key.is_empty() {
                    continue;
                }
                match by_name.get(&key) {
                    Some(node) => {
                        if seen.insert(node.clone()) {
                            resolved.push(node.clone());
                        }
                    }
                    None => invalid.push(requested.clone()),
                }
            }
            if !invalid.is_empty() {
                return Err(ClusrunError::InvalidNodes(invalid));
            }
            resolved
        };

        if nodes.is_empty() {
            return Err(ClusrunError::NoValidNodes);
        }
        Ok(nodes)
    }

    /// Create a job and start running it on its nodes.
    ///
    /// All input is checked before the job is stored. The returned receiver
    /// already holds the first frame (job id and nodes); it is closed once
    /// the job has been finalized.
    pub fn start_job(self: &Arc<Self>, spec: JobSpec, intersect: bool) -> Result<(Job, ReplyReceiver)> {
        if spec.command.trim().is_empty() {
            return Err(ClusrunError::InvalidArgument("Empty command".to_string()));
        }
        let nodes = self.resolve_nodes(&spec, intersect)?;

        let sweep = (!spec.sweep.is_empty()).then(|| parse_sweep(&spec.sweep, nodes.len()));
        if let Some(sweep) = &sweep {
            if !spec.command.contains(&sweep.placeholder) {
                return Err(ClusrunError::InvalidArgument(format!(
                    "Sweep placeholder {:?} is not found in the command",
                    sweep.placeholder
                )));
            }
        }

        let job = self
            .store
            .create_job(spec, nodes, self.settings.max_job_count())?;

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let first = proto::StartClusJobReply {
            job_id: job.id,
            nodes: job.nodes.clone(),
            ..Default::default()
        };
        // Fresh channel with spare capacity, cannot fail
        let _ = tx.try_send(Ok(first));

        let tasks: Vec<NodeTask> = job
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| NodeTask {
                job_id: job.id,
                node: node.clone(),
                command: match &sweep {
                    Some(s) => s.apply(&job.command, index),
                    None => job.command.clone(),
                },
                arguments: job
                    .arguments
                    .iter()
                    .map(|a| match &sweep {
                        Some(s) => s.apply(a, index),
                        None => a.clone(),
                    })
                    .collect(),
                headnode: self.headnode.to_string(),
                output: self
                    .settings
                    .store_output()
                    .then(|| self.store.output_files(job.id, node)),
                tx: tx.clone(),
            })
            .collect();

        let this = Arc::clone(self);
        let job_id = job.id;
        tokio::spawn(async move {
            if let Err(e) = this.run_job(job_id, tasks).await {
                tracing::error!(job_id, error = %e, "Job dispatch failed");
                let _ = tx.send(Err(e.into())).await;
            }
        });

        Ok((job, rx))
    }

    async fn run_job(&self, job_id: i32, tasks: Vec<NodeTask>) -> Result<()> {
        if !self
            .store
            .update_state(job_id, JobState::Created, JobState::Dispatching)?
        {
            return Ok(());
        }

        let mut set = JoinSet::new();
        let mut issued = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (issued_tx, issued_rx) = oneshot::channel();
            issued.push(issued_rx);
            set.spawn(async move {
                let node = task.node.clone();
                let exit_code = task.run(issued_tx).await;
                (node, exit_code)
            });
        }
        for rx in issued {
            let _ = rx.await;
        }
        self.store
            .update_state(job_id, JobState::Dispatching, JobState::Running)?;

        let mut failed_nodes = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, 0)) => {}
                Ok((node, exit_code)) => {
                    failed_nodes.insert(node, exit_code);
                }
                Err(e) => {
                    return Err(ClusrunError::Internal(format!("Node task panicked: {}", e)));
                }
            }
        }

        self.store.finish_job(job_id, failed_nodes)?;
        Ok(())
    }

    /// Cancel every active job in `ids` and wait for the result on each node.
    ///
    /// Returns the final state of each cancelled job. Jobs that were not
    /// active are left out, so an empty map means no job was cancelled.
    pub async fn cancel_jobs(&self, ids: &BTreeSet<i32>) -> Result<BTreeMap<i32, JobState>> {
        let plan = self.store.mark_canceling(ids)?;
        if plan.jobs.is_empty() {
            tracing::info!(?ids, "No job is cancelled");
            return Ok(BTreeMap::new());
        }

        let mut set = JoinSet::new();
        for (job_id, nodes) in plan.jobs {
            let headnode = self.headnode.to_string();
            set.spawn(async move {
                let failed = cancel_on_nodes(job_id, nodes, headnode).await;
                (job_id, failed)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (job_id, failed) = joined
                .map_err(|e| ClusrunError::Internal(format!("Cancel task panicked: {}", e)))?;
            let state = self.store.finish_cancel(job_id, failed)?;
            results.insert(job_id, state);
        }
        Ok(results)
    }
}

/// One node's slice of a job.
struct NodeTask {
    job_id: i32,
    node: String,
    command: String,
    arguments: Vec<String>,
    headnode: String,
    output: Option<(PathBuf, PathBuf)>,
    tx: ReplySender,
}

impl NodeTask {
    /// Run on the node and relay its output. Returns the node's exit code.
    async fn run(self, issued: oneshot::Sender<()>) -> i32 {
        let host = host_of_display_name(&self.node);
        let mut sink = OutputSink::open(self.job_id, &self.node, self.output.clone()).await;
        let mut relay = Relay {
            job_id: self.job_id,
            node: self.node.clone(),
            tx: self.tx.clone(),
            broken: false,
        };

        let request = proto::StartJobRequest {
            job_id: self.job_id,
            command: self.command.clone(),
            arguments: self.arguments.clone(),
            headnode: self.headnode.clone(),
        };
        let started = start_remote(&host, request).await;
        let _ = issued.send(());

        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(job_id = self.job_id, node = %self.node, error = %e, "Failed to start job on node");
                sink.finish().await;
                relay.exit(EXIT_UNREACHABLE).await;
                return EXIT_UNREACHABLE;
            }
        };

        let mut exit_code = None;
        loop {
            match stream.message().await {
                Ok(Some(reply)) => {
                    if !reply.stdout.is_empty() {
                        sink.stdout(&reply.stdout).await;
                        relay.stdout(reply.stdout).await;
                    }
                    if !reply.stderr.is_empty() {
                        sink.stderr(&reply.stderr).await;
                        relay.stderr(reply.stderr).await;
                    }
                    if reply.exit_code.is_some() {
                        exit_code = reply.exit_code;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    tracing::warn!(job_id = self.job_id, node = %self.node, error = %status, "Output stream broken");
                    break;
                }
            }
        }

        let exit_code = exit_code.unwrap_or(EXIT_UNREACHABLE);
        sink.finish().await;
        relay.exit(exit_code).await;
        tracing::info!(job_id = self.job_id, node = %self.node, exit_code, "Node finished job");
        exit_code
    }
}

async fn start_remote(
    host: &str,
    request: proto::StartJobRequest,
) -> Result<tonic::Streaming<proto::StartJobReply>> {
    let channel = client::connect(host).await?;
    let mut client = ClusnodeClient::new(channel);
    Ok(client.start_job(request).await?.into_inner())
}

async fn cancel_on_nodes(job_id: i32, nodes: Vec<String>, headnode: String) -> Vec<String> {
    let mut set = JoinSet::new();
    for node in nodes {
        let headnode = headnode.clone();
        set.spawn(async move {
            let result = cancel_remote(&host_of_display_name(&node), job_id, headnode).await;
            if let Err(e) = &result {
                tracing::warn!(job_id, node = %node, error = %e, "Failed to cancel job on node");
            }
            (node, result.is_ok())
        });
    }

    let mut failed = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, true)) => {}
            Ok((node, false)) => failed.push(node),
            Err(e) => tracing::error!(job_id, error = %e, "Cancel task panicked"),
        }
    }
    failed.sort();
    failed
}

async fn cancel_remote(host: &str, job_id: i32, headnode: String) -> Result<()> {
    let channel = client::connect(host).await?;
    let mut client = ClusnodeClient::new(channel);
    client
        .cancel_job(proto::CancelJobRequest { job_id, headnode })
        .await?;
    Ok(())
}

/// Forwards one node's frames to the submitter.
///
/// A closed receiver is logged once; the node keeps running and its output
/// keeps going to the output files.
struct Relay {
    job_id: i32,
    node: String,
    tx: ReplySender,
    broken: bool,
}

impl Relay {
    async fn stdout(&mut self, stdout: String) {
        self.send(proto::StartClusJobReply {
            node: self.node.clone(),
            stdout,
            ..Default::default()
        })
        .await;
    }

    async fn stderr(&mut self, stderr: String) {
        self.send(proto::StartClusJobReply {
            node: self.node.clone(),
            stderr,
            ..Default::default()
        })
        .await;
    }

    async fn exit(&mut self, exit_code: i32) {
        self.send(proto::StartClusJobReply {
            node: self.node.clone(),
            exit_code: Some(exit_code),
            ..Default::default()
        })
        .await;
    }

    async fn send(&mut self, reply: proto::StartClusJobReply) {
        if self.broken {
            return;
        }
        if self.tx.send(Ok(reply)).await.is_err() {
            tracing::warn!(job_id = self.job_id, node = %self.node, "Submitter disconnected, output no longer relayed");
            self.broken = true;
        }
    }
}

/// Mirrors one node's output to its `.out`/`.err` files.
struct OutputSink {
    job_id: i32,
    node: String,
    files: Option<SinkFiles>,
}

struct SinkFiles {
    stdout: File,
    stderr: File,
    stderr_path: PathBuf,
    stderr_written: bool,
}

impl OutputSink {
    async fn open(job_id: i32, node: &str, paths: Option<(PathBuf, PathBuf)>) -> Self {
        let mut sink = Self {
            job_id,
            node: node.to_string(),
            files: None,
        };
        let Some((stdout_path, stderr_path)) = paths else {
            return sink;
        };
        match tokio::try_join!(File::create(&stdout_path), File::create(&stderr_path)) {
            Ok((stdout, stderr)) => {
                sink.files = Some(SinkFiles {
                    stdout,
                    stderr,
                    stderr_path,
                    stderr_written: false,
                });
            }
            Err(e) => {
                tracing::warn!(job_id, node, error = %e, "Failed to create output files");
            }
        }
        sink
    }

    async fn stdout(&mut self, content: &str) {
        if let Some(files) = self.files.as_mut() {
            if let Err(e) = files.stdout.write_all(content.as_bytes()).await {
                tracing::warn!(job_id = self.job_id, node = %self.node, error = %e, "Failed to write stdout file");
            }
        }
    }

    async fn stderr(&mut self, content: &str) {
        if let Some(files) = self.files.as_mut() {
            files.stderr_written = true;
            if let Err(e) = files.stderr.write_all(content.as_bytes()).await {
                tracing::warn!(job_id = self.job_id, node = %self.node, error = %e, "Failed to write stderr file");
            }
        }
    }

    /// Flush both files and drop the stderr file if nothing was written to it.
    async fn finish(&mut self) {
        let Some(mut files) = self.files.take() else {
            return;
        };
        let _ = files.stdout.flush().await;
        let _ = files.stderr.flush().await;
        drop(files.stderr);
        if !files.stderr_written {
            if let Err(e) = tokio::fs::remove_file(&files.stderr_path).await {
                tracing::debug!(job_id = self.job_id, node = %self.node, error = %e, "Failed to remove empty stderr file");
            }
        }
    }
}
