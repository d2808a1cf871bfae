use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::clusnode_service::ClusnodeService;
use crate::grpc::headnode_service::HeadnodeService;
use crate::proto::clusnode_server::ClusnodeServer;
use crate::proto::headnode_server::HeadnodeServer;

/// Serves both roles on one listener.
pub struct GrpcServer {
    addr: SocketAddr,
    headnode: Option<HeadnodeService>,
    clusnode: Option<ClusnodeService>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            headnode: None,
            clusnode: None,
        }
    }

    pub fn with_headnode(mut self, service: HeadnodeService) -> Self {
        self.headnode = Some(service);
        self
    }

    pub fn with_clusnode(mut self, service: ClusnodeService) -> Self {
        self.clusnode = Some(service);
        self
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(
            addr = %self.addr,
            headnode = self.headnode.is_some(),
            clusnode = self.clusnode.is_some(),
            "Starting gRPC server"
        );

        Server::builder()
            .add_optional_service(self.headnode.map(HeadnodeServer::new))
            .add_optional_service(self.clusnode.map(ClusnodeServer::new))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }

    /// Like [`run`](Self::run) on an already bound listener.
    pub async fn run_with_listener(
        self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        Server::builder()
            .add_optional_service(self.headnode.map(HeadnodeServer::new))
            .add_optional_service(self.clusnode.map(ClusnodeServer::new))
            .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
            .await
    }
}
