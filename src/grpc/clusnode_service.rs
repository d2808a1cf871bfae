use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use crate::clusnode::{job_label, HeadnodeReporter, JobExecutor, Output};
use crate::config::{ConfigFile, Settings, HEADNODES_TO_REPORT, ROLE_CLUSNODE};
use crate::proto::clusnode_server::Clusnode;
use crate::proto::{
    CancelJobRequest, Empty, GetConfigsReply, SetConfigsReply, SetConfigsRequest,
    SetHeadnodesReply, SetHeadnodesRequest, StartJobReply, StartJobRequest, ValidateReply,
    ValidateRequest,
};

type JobOutputStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<StartJobReply, Status>> + Send>>;

const OUTPUT_BUFFER: usize = 64;

/// gRPC service of the worker role.
pub struct ClusnodeService {
    node_name: String,
    executor: JobExecutor,
    reporter: Arc<HeadnodeReporter>,
    settings: Arc<Settings>,
    config_file: Option<ConfigFile>,
}

impl ClusnodeService {
    pub fn new(
        node_name: &str,
        executor: JobExecutor,
        reporter: Arc<HeadnodeReporter>,
        settings: Arc<Settings>,
        config_file: Option<ConfigFile>,
    ) -> Self {
        Self {
            node_name: node_name.to_uppercase(),
            executor,
            reporter,
            settings,
            config_file,
        }
    }

    async fn save_config(&self) {
        if let Some(file) = &self.config_file {
            let headnodes = self.reporter.headnodes();
            if let Err(e) = file
                .save_in_background(self.settings.clone(), Some(headnodes))
                .await
            {
                tracing::warn!(error = %e, "Failed to save config");
            }
        }
    }
}

fn to_reply(output: Output) -> Result<StartJobReply, Status> {
    Ok(match output {
        Output::Stdout(stdout) => StartJobReply {
            stdout,
            ..Default::default()
        },
        Output::Stderr(stderr) => StartJobReply {
            stderr,
            ..Default::default()
        },
        Output::Exit(code) => StartJobReply {
            exit_code: Some(code),
            ..Default::default()
        },
    })
}

#[tonic::async_trait]
impl Clusnode for ClusnodeService {
    async fn validate(&self, request: Request<ValidateRequest>) -> Result<Response<ValidateReply>, Status> {
        let req = request.into_inner();
        tracing::info!(headnode = %req.headnode, host = %req.clusnode, "Validation requested");
        Ok(Response::new(ValidateReply {
            nodename: self.node_name.clone(),
        }))
    }

    async fn set_headnodes(
        &self,
        request: Request<SetHeadnodesRequest>,
    ) -> Result<Response<SetHeadnodesReply>, Status> {
        let req = request.into_inner();
        let mode = req.mode();
        let results = self.reporter.set_headnodes(&req.headnodes, mode);
        self.save_config().await;
        Ok(Response::new(SetHeadnodesReply {
            results: results.into_iter().collect(),
        }))
    }

    type StartJobStream = JobOutputStream;

    async fn start_job(
        &self,
        request: Request<StartJobRequest>,
    ) -> Result<Response<Self::StartJobStream>, Status> {
        let req = request.into_inner();
        if req.headnode.is_empty() {
            return Err(Status::invalid_argument("Headnode should be specified"));
        }
        let label = job_label(&req.headnode, req.job_id);
        if self.executor.is_running(&label) {
            return Err(Status::already_exists(format!("Job {} is already running", label)));
        }
        tracing::info!(label = %label, command = %req.command, "Job received");

        let (tx, rx) = tokio::sync::mpsc::channel(OUTPUT_BUFFER);
        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor
                .execute(&label, &req.command, &req.arguments, tx)
                .await;
        });

        let stream = ReceiverStream::new(rx).map(to_reply);
        Ok(Response::new(Box::pin(stream) as Self::StartJobStream))
    }

    async fn cancel_job(&self, request: Request<CancelJobRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let label = job_label(&req.headnode, req.job_id);
        self.executor
            .cancel(&label)
            .map_err(|e| Status::internal(format!("Failed to cancel job {}: {}", label, e)))?;
        Ok(Response::new(Empty {}))
    }

    async fn set_configs(
        &self,
        request: Request<SetConfigsRequest>,
    ) -> Result<Response<SetConfigsReply>, Status> {
        let configs = request.into_inner().configs.into_iter().collect();
        let results = self.settings.set(ROLE_CLUSNODE, &configs)?;
        self.save_config().await;
        Ok(Response::new(SetConfigsReply {
            results: results.into_iter().collect(),
        }))
    }

    async fn get_configs(&self, _request: Request<Empty>) -> Result<Response<GetConfigsReply>, Status> {
        let mut configs: std::collections::HashMap<String, String> =
            self.settings.get(ROLE_CLUSNODE)?.into_iter().collect();
        configs.insert(
            format!("{} (connected)", HEADNODES_TO_REPORT),
            self.reporter.connected().join(", "),
        );
        configs.insert(
            format!("{} (connecting)", HEADNODES_TO_REPORT),
            self.reporter.connecting().join(", "),
        );
        Ok(Response::new(GetConfigsReply { configs }))
    }
}
