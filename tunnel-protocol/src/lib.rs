//! # Control Channel Wire Frames
//!
//! Defines the JSON frames exchanged between the edge and an agent over the
//! control channel (§4.3, §6 of the design). Messages are serialized with
//! serde's adjacently-tagged representation: `{"action": "...", "data": {...}}`,
//! which matches the normative wire format exactly — unit variants such as
//! `Ping`/`Pong` serialize to `{"action":"ping"}` with no `data` key.
//!
//! This crate carries no transport code; it only defines what goes over the
//! wire, so it has no opinion on WebSockets, reconnection, or framing at the
//! byte level.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on a single frame's serialized size. The channel may reject
/// anything larger; senders must chunk under this ceiling.
pub const FMAX: usize = 128 * 1024;

/// Request bodies larger than this are sent as a stream of `proxy_chunk`
/// frames instead of inline in the `proxy` frame.
pub const FCHUNK: usize = 90 * 1024;

/// Response bodies larger than this (or binary content-types) are staged
/// through the object store instead of chunked inline, provided a presigned
/// upload handle is available.
pub const FSTAGE: usize = 256 * 1024;

/// A single control-channel message.
///
/// `action` drives the tag; `data` (when present) carries the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum Frame {
    /// Edge → agent: request envelope (terminal, or header for a chunked body).
    Proxy(ProxyRequest),
    /// Edge → agent: one inbound body chunk.
    ProxyChunk(Chunk),
    /// Agent → edge: terminal buffered response, or header-only if chunked/staged.
    ProxyResponse(ProxyResponse),
    /// Agent → edge: one outbound body chunk.
    ProxyResponseChunk(Chunk),
    /// Agent → edge: SSE bracket open (status + headers).
    ProxyStreamStart(StreamStart),
    /// Agent → edge: one SSE event.
    ProxyStreamChunk(Chunk),
    /// Agent → edge: SSE bracket close.
    ProxyStreamEnd(StreamEnd),
    /// Either direction: heartbeat request.
    Ping,
    /// Either direction: heartbeat response.
    Pong,
}

impl Frame {
    /// The `request_id` this frame correlates to, if any (`Ping`/`Pong` carry none).
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::Proxy(p) => Some(&p.request_id),
            Frame::ProxyChunk(c) => Some(&c.request_id),
            Frame::ProxyResponse(r) => Some(&r.request_id),
            Frame::ProxyResponseChunk(c) => Some(&c.request_id),
            Frame::ProxyStreamStart(s) => Some(&s.request_id),
            Frame::ProxyStreamChunk(c) => Some(&c.request_id),
            Frame::ProxyStreamEnd(e) => Some(&e.request_id),
            Frame::Ping | Frame::Pong => None,
        }
    }
}

/// `proxy` frame payload: the request envelope the edge hands to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Inline body. Empty when the body was sent as `proxy_chunk` frames
    /// (see `total_chunks`) or staged in the object store (`s3_request_get_url`).
    #[serde(default)]
    pub body: String,
    /// Number of `proxy_chunk` frames preceding this one, carrying the body.
    /// `0` means the body (if any) is inline in `body`.
    #[serde(default)]
    pub total_chunks: u32,
    /// Presigned PUT handle the agent can hand to the local server's
    /// response path if it wants to stage a large response (unused on
    /// this frame; populated by the edge for symmetry with `proxy_response`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_put_url: Option<String>,
    /// Presigned GET handle for a request body staged via the upload-notify
    /// path (§4.6). Mutually exclusive with `body`/`total_chunks`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_request_get_url: Option<String>,
}

/// Shared shape for `proxy_chunk`, `proxy_response_chunk`, and `proxy_stream_chunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub request_id: String,
    pub chunk_index: u32,
    pub data: String,
}

/// `proxy_response` frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub request_id: String,
    pub status_code: u16,
    pub response_headers: HashMap<String, String>,
    /// Inline body. Empty when `total_chunks > 0` or `s3_response_key` is set.
    #[serde(default)]
    pub response_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_response_key: Option<String>,
}

/// `proxy_stream_start` frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStart {
    pub request_id: String,
    pub status_code: u16,
    pub response_headers: HashMap<String, String>,
}

/// `proxy_stream_end` frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnd {
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_has_no_data_field() {
        let json = serde_json::to_value(Frame::Ping).unwrap();
        assert_eq!(json, serde_json::json!({"action": "ping"}));
    }

    #[test]
    fn proxy_round_trips_through_json() {
        let frame = Frame::Proxy(ProxyRequest {
            request_id: "abc123".into(),
            method: "GET".into(),
            path: "/ping".into(),
            headers: HashMap::new(),
            body: String::new(),
            total_chunks: 0,
            s3_put_url: None,
            s3_request_get_url: None,
        });
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.request_id(), Some("abc123"));
    }

    #[test]
    fn chunk_action_names_are_snake_case() {
        let c = Chunk {
            request_id: "r1".into(),
            chunk_index: 0,
            data: "aGVsbG8=".into(),
        };
        let json = serde_json::to_value(Frame::ProxyChunk(c)).unwrap();
        assert_eq!(json["action"], "proxy_chunk");
    }
}
