//! Error taxonomy for the Edge Handler (design §7), each variant mapped to
//! exactly the HTTP status the design specifies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("unknown subdomain")]
    UnknownSubdomain,

    #[error("tunnel inactive past reconnect grace")]
    TunnelInactive,

    #[error("failed to push frame to agent")]
    PushFailed,

    #[error("poll deadline exceeded")]
    DeadlineExceeded,

    /// The caller closed the connection before a response was ready (§4.4
    /// step 6, §7). Never returned as an HTTP response to that same caller
    /// — the connection is already gone — but its status mapping is what
    /// the disconnect cleanup path in `routes.rs` records the failure as.
    #[error("caller disconnected before response was ready")]
    CallerDisconnected,

    #[error("store error: {0}")]
    Store(#[from] tunnel_store::StoreError),
}

impl EdgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeError::UnknownSubdomain => StatusCode::NOT_FOUND,
            EdgeError::TunnelInactive => StatusCode::SERVICE_UNAVAILABLE,
            EdgeError::PushFailed => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            EdgeError::CallerDisconnected => StatusCode::from_u16(499).unwrap(),
            EdgeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
