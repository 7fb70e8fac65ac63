use thiserror::Error;

/// Errors surfaced by the store backends.
///
/// These are backend-agnostic: a caller in `tunnel-edge` maps them onto the
/// HTTP status taxonomy of the design's error handling section without
/// needing to know whether the backend is the in-memory store or DynamoDB.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry already exists")]
    AlreadyExists,

    #[error("entry not found")]
    NotFound,

    #[error("backend error: {0}")]
    Backend(String),
}
