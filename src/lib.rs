pub mod clusnode;
pub mod config;
pub mod error;
pub mod grpc;
pub mod headnode;
pub mod host;
pub mod node;
pub mod shutdown;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("clusrun");
}
