pub mod client;
pub mod clusnode_service;
pub mod headnode_service;
pub mod server;

pub use clusnode_service::ClusnodeService;
pub use headnode_service::HeadnodeService;
pub use server::GrpcServer;
