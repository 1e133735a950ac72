use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("xdp error: {0}")]
    Xdp(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("certificate error: {0}")]
    Cert(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tonic::Status> for AgentError {
    fn from(status: tonic::Status) -> Self {
        AgentError::Rpc(status.message().to_string())
    }
}

impl From<tonic::transport::Error> for AgentError {
    fn from(err: tonic::transport::Error) -> Self {
        AgentError::Rpc(err.to_string())
    }
}
