use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("object store transfer failed: {0}")]
    ObjectTransfer(String),
}
