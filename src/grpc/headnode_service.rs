use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::config::{ConfigFile, Settings, ROLE_HEADNODE};
use crate::headnode::job::JobSpec;
use crate::headnode::liveness::{NodeQuery, NodeState};
use crate::headnode::{Dispatcher, NodeGroups, NodeLiveness};
use crate::proto::headnode_server::Headnode;
use crate::proto::{
    CancelClusJobsReply, CancelClusJobsRequest, Empty, GetConfigsReply, GetJobsReply,
    GetJobsRequest, GetNodesReply, GetNodesRequest, HeartbeatRequest, NodeInfo,
    SetConfigsReply, SetConfigsRequest, SetNodeGroupsRequest, StartClusJobReply,
    StartClusJobRequest,
};

type ClusJobStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<StartClusJobReply, Status>> + Send>>;

/// gRPC service of the coordinator role.
pub struct HeadnodeService {
    liveness: Arc<NodeLiveness>,
    groups: Arc<NodeGroups>,
    dispatcher: Arc<Dispatcher>,
    settings: Arc<Settings>,
    config_file: Option<ConfigFile>,
}

impl HeadnodeService {
    pub fn new(
        liveness: Arc<NodeLiveness>,
        groups: Arc<NodeGroups>,
        dispatcher: Arc<Dispatcher>,
        settings: Arc<Settings>,
        config_file: Option<ConfigFile>,
    ) -> Self {
        Self {
            liveness,
            groups,
            dispatcher,
            settings,
            config_file,
        }
    }
}

#[tonic::async_trait]
impl Headnode for HeadnodeService {
    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.liveness
            .record_heartbeat(&req.nodename, &req.host)
            .map_err(|e| {
                tracing::warn!(nodename = %req.nodename, host = %req.host, error = %e, "Heartbeat rejected");
                Status::from(e)
            })?;
        Ok(Response::new(Empty {}))
    }

    async fn get_nodes(
        &self,
        request: Request<GetNodesRequest>,
    ) -> Result<Response<GetNodesReply>, Status> {
        let req = request.into_inner();
        let state = NodeState::from_proto(req.state());
        let query = NodeQuery {
            pattern: req.pattern,
            state,
            groups: req.groups,
            intersect: req.intersect,
        };
        let nodes = self
            .liveness
            .get_nodes(&query, &self.groups)?
            .into_iter()
            .map(|n| NodeInfo {
                name: n.name,
                state: n.state.to_proto() as i32,
                groups: n.groups,
            })
            .collect();
        Ok(Response::new(GetNodesReply { nodes }))
    }

    async fn get_jobs(&self, request: Request<GetJobsRequest>) -> Result<Response<GetJobsReply>, Status> {
        let ids: BTreeSet<i32> = request.into_inner().job_ids.into_iter().collect();
        let jobs = self
            .dispatcher
            .store()
            .get_jobs(&ids)?
            .iter()
            .map(|j| j.to_proto())
            .collect();
        Ok(Response::new(GetJobsReply { jobs }))
    }

    type StartClusJobStream = ClusJobStream;

    async fn start_clus_job(
        &self,
        request: Request<StartClusJobRequest>,
    ) -> Result<Response<Self::StartClusJobStream>, Status> {
        let req = request.into_inner();
        let spec = JobSpec {
            name: req.name,
            command: req.command,
            arguments: req.arguments,
            sweep: req.sweep,
            node_pattern: req.pattern,
            node_groups: req.groups,
            specified_nodes: req.nodes,
        };

        let (job, rx) = self.dispatcher.start_job(spec, req.intersect).map_err(|e| {
            tracing::warn!(error = %e, "Failed to create job");
            Status::from(e)
        })?;
        tracing::info!(job_id = job.id, command = %job.command, nodes = job.nodes.len(), "Job started");

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::StartClusJobStream))
    }

    async fn cancel_clus_jobs(
        &self,
        request: Request<CancelClusJobsRequest>,
    ) -> Result<Response<CancelClusJobsReply>, Status> {
        let ids: BTreeSet<i32> = request.into_inner().job_ids.into_iter().collect();
        let result = self
            .dispatcher
            .cancel_jobs(&ids)
            .await?
            .into_iter()
            .map(|(id, state)| (id, state.to_proto() as i32))
            .collect();
        Ok(Response::new(CancelClusJobsReply { result }))
    }

    async fn set_node_groups(
        &self,
        request: Request<SetNodeGroupsRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        if req.groups.is_empty() || req.nodes.is_empty() {
            return Err(Status::invalid_argument("Groups and nodes should be specified"));
        }
        self.groups.set(&req.groups, &req.nodes, req.remove)?;
        Ok(Response::new(Empty {}))
    }

    async fn set_configs(
        &self,
        request: Request<SetConfigsRequest>,
    ) -> Result<Response<SetConfigsReply>, Status> {
        let configs = request.into_inner().configs.into_iter().collect();
        let results = self.settings.set(ROLE_HEADNODE, &configs)?;
        if let Some(file) = &self.config_file {
            if let Err(e) = file.save_in_background(self.settings.clone(), None).await {
                tracing::warn!(error = %e, "Failed to save config");
            }
        }
        Ok(Response::new(SetConfigsReply {
            results: results.into_iter().collect(),
        }))
    }

    async fn get_configs(&self, _request: Request<Empty>) -> Result<Response<GetConfigsReply>, Status> {
        let configs = self.settings.get(ROLE_HEADNODE)?.into_iter().collect();
        Ok(Response::new(GetConfigsReply { configs }))
    }
}
