use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clusnode::{HeadnodeReporter, JobExecutor};
use crate::config::{ConfigFile, NodeConfig, Settings};
use crate::error::Result;
use crate::grpc::{ClusnodeService, GrpcServer, HeadnodeService};
use crate::headnode::liveness::{GrpcProbe, SystemClock};
use crate::headnode::{Dispatcher, JobStore, NodeGroups, NodeLiveness};
use crate::proto::SetHeadnodesMode;

/// One node process serving both the headnode and the clusnode role.
///
/// All on-disk state lives in the data directory, prefixed with the node's
/// file-safe host so several nodes can share one directory:
/// `<HOST>.jobs`, `<HOST>.groups`, `<HOST>.output/` and `<HOST>.command/`.
pub struct Node {
    pub config: NodeConfig,
    pub settings: Arc<Settings>,
    pub liveness: Arc<NodeLiveness>,
    pub groups: Arc<NodeGroups>,
    pub dispatcher: Arc<Dispatcher>,
    pub reporter: Arc<HeadnodeReporter>,
    pub executor: JobExecutor,
    config_file: ConfigFile,
    headnodes: Vec<String>,
    shutdown: CancellationToken,
}

impl Node {
    /// Load saved settings and open the job store and group registry.
    ///
    /// Failing to open persistent state is fatal at startup.
    pub fn new(config: NodeConfig, shutdown: CancellationToken) -> Result<Self> {
        let settings = Arc::new(Settings::default());
        let config_file = ConfigFile::new(&config.config_file, &config.lock_file, &config.host);
        let saved_headnodes = config_file.load(&settings);

        std::fs::create_dir_all(&config.data_dir)?;
        let path = |suffix: &str| -> PathBuf {
            config
                .data_dir
                .join(format!("{}.{}", config.host.file_name(), suffix))
        };

        let store = Arc::new(JobStore::open(path("jobs"), path("output"))?);
        let groups = Arc::new(NodeGroups::open(path("groups"))?);
        let liveness = Arc::new(NodeLiveness::new(
            config.host.hostname(),
            Arc::clone(&settings),
            Arc::new(GrpcProbe::new(&config.host)),
            Arc::new(SystemClock),
            shutdown.child_token(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.host.clone(),
            store,
            Arc::clone(&liveness),
            Arc::clone(&groups),
            Arc::clone(&settings),
        ));
        let executor = JobExecutor::new(path("command"));
        let reporter = Arc::new(HeadnodeReporter::new(
            &config.node_name,
            config.host.clone(),
            Arc::clone(&settings),
            shutdown.child_token(),
        ));

        let headnodes = if !config.headnodes.is_empty() {
            config.headnodes.clone()
        } else if !saved_headnodes.is_empty() {
            saved_headnodes
        } else {
            vec![config.host.to_string()]
        };

        Ok(Self {
            config,
            settings,
            liveness,
            groups,
            dispatcher,
            reporter,
            executor,
            config_file,
            headnodes,
            shutdown,
        })
    }

    /// Start reporting to the configured headnodes and build the server.
    fn start(self) -> (GrpcServer, CancellationToken) {
        for (headnode, result) in self
            .reporter
            .set_headnodes(&self.headnodes, SetHeadnodesMode::Add)
        {
            tracing::info!(headnode = %headnode, result = %result, "Reporting to headnode");
        }
        if let Err(e) = self
            .config_file
            .save(&self.settings, Some(self.reporter.headnodes().as_slice()))
        {
            tracing::warn!(error = %e, "Failed to save config");
        }

        let headnode = HeadnodeService::new(
            self.liveness,
            self.groups,
            self.dispatcher,
            Arc::clone(&self.settings),
            Some(self.config_file.clone()),
        );
        let clusnode = ClusnodeService::new(
            &self.config.node_name,
            self.executor,
            self.reporter,
            self.settings,
            Some(self.config_file),
        );

        tracing::info!(
            node = %self.config.node_name,
            host = %self.config.host,
            data_dir = %self.config.data_dir.display(),
            "Node started"
        );
        let server = GrpcServer::new(self.config.listen_addr)
            .with_headnode(headnode)
            .with_clusnode(clusnode);
        (server, self.shutdown)
    }

    /// Serve on the configured listen address until shutdown.
    pub async fn run(self) -> Result<()> {
        let (server, shutdown) = self.start();
        server.run(shutdown).await?;
        Ok(())
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn run_with_listener(self, listener: tokio::net::TcpListener) -> Result<()> {
        let (server, shutdown) = self.start();
        server.run_with_listener(listener, shutdown).await?;
        Ok(())
    }
}
