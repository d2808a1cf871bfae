use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusrunError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("Invalid host address {0:?}: {1}")]
    InvalidHost(String, String),

    #[error("Invalid nodes ({}): {}", .0.len(), .0.join(", "))]
    InvalidNodes(Vec<String>),

    #[error("No valid nodes to create job")]
    NoValidNodes,

    #[error("Job not found: {0}")]
    JobNotFound(i32),

    #[error("Job count reaches the capacity {capacity} and all {active} jobs are active")]
    CapacityExceeded { capacity: usize, active: usize },

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ClusrunError>;

impl From<ClusrunError> for tonic::Status {
    fn from(err: ClusrunError) -> Self {
        let message = err.to_string();
        match err {
            ClusrunError::InvalidArgument(_)
            | ClusrunError::InvalidHost(..)
            | ClusrunError::InvalidNodes(_)
            | ClusrunError::Config(_) => tonic::Status::invalid_argument(message),
            ClusrunError::NoValidNodes => tonic::Status::failed_precondition(message),
            ClusrunError::JobNotFound(_) => tonic::Status::not_found(message),
            ClusrunError::CapacityExceeded { .. } => tonic::Status::resource_exhausted(message),
            ClusrunError::Transport(_) => tonic::Status::unavailable(message),
            ClusrunError::Rpc(status) => status,
            ClusrunError::Storage(_)
            | ClusrunError::Serialization(_)
            | ClusrunError::Internal(_) => tonic::Status::internal(message),
        }
    }
}
