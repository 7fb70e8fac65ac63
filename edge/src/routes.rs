//! # Edge Handler — Public HTTP Surface
//!
//! The three logical endpoints of §6: the synchronous tunneled request, the
//! deferred-body upload endpoint, and the poll endpoint. All three follow
//! the algorithm of §4.4: resolve the tunnel, write a pending entry, push a
//! frame to the agent, then either poll synchronously (tunnel_handler) or
//! hand the caller a `request_id` to poll later (upload_url_handler +
//! poll_handler).

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;
use tunnel_protocol::{Chunk, ProxyRequest, Frame, FCHUNK};
use tunnel_store::registry::TunnelStatus;
use tunnel_store::{
    generate_request_id, objectstore, PendingRequest, PendingStatus, ResponseView, TunnelId,
};

use crate::error::EdgeError;
use crate::state::AppState;

fn header_map_to_string_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

fn string_map_to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (k, v) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(k.as_str()),
            HeaderValue::from_str(v.as_str()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// Sends a request body to the agent, chunking it through `proxy_chunk`
/// frames when it exceeds `FCHUNK` (§4.4 step 5).
async fn push_request(
    state: &AppState,
    tunnel_id: &TunnelId,
    request_id: &str,
    method: &Method,
    path: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
    s3_put_url: Option<String>,
) -> Result<(), EdgeError> {
    let binding = state
        .registry
        .get(tunnel_id)
        .await?
        .ok_or(EdgeError::TunnelInactive)?;
    let connection_id = binding.connection_id.ok_or(EdgeError::TunnelInactive)?;
    let tx = state
        .connections
        .get(&connection_id)
        .ok_or(EdgeError::PushFailed)?
        .clone();

    if body.len() > FCHUNK {
        let chunks: Vec<&[u8]> = body.chunks(FCHUNK).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            let frame = Frame::ProxyChunk(Chunk {
                request_id: request_id.to_string(),
                chunk_index: index as u32,
                data: BASE64.encode(chunk),
            });
            tx.send(frame).map_err(|_| EdgeError::PushFailed)?;
        }
        let frame = Frame::Proxy(ProxyRequest {
            request_id: request_id.to_string(),
            method: method.as_str().to_string(),
            path: path.to_string(),
            headers: headers.clone(),
            body: String::new(),
            total_chunks: chunks.len() as u32,
            s3_put_url,
            s3_request_get_url: None,
        });
        tx.send(frame).map_err(|_| EdgeError::PushFailed)?;
    } else {
        let frame = Frame::Proxy(ProxyRequest {
            request_id: request_id.to_string(),
            method: method.as_str().to_string(),
            path: path.to_string(),
            headers: headers.clone(),
            body: BASE64.encode(body),
            total_chunks: 0,
            s3_put_url,
            s3_request_get_url: None,
        });
        tx.send(frame).map_err(|_| EdgeError::PushFailed)?;
    }
    Ok(())
}

/// Waits out the reconnect-grace window (§4.4 step 2) if the tunnel is
/// currently inactive but was recently seen.
async fn await_active_tunnel(state: &AppState, tunnel_id: &TunnelId) -> Result<(), EdgeError> {
    let binding = state
        .registry
        .get(tunnel_id)
        .await?
        .ok_or(EdgeError::UnknownSubdomain)?;
    if binding.status == TunnelStatus::Active {
        return Ok(());
    }

    let now = tunnel_store::pending::now_ms();
    let eligible = now.saturating_sub(binding.updated_at_ms)
        < state.config.reconnect_grace_eligibility.as_millis() as u64;
    if !eligible {
        return Err(EdgeError::TunnelInactive);
    }

    let deadline = Instant::now() + state.config.reconnect_grace;
    loop {
        if Instant::now() >= deadline {
            return Err(EdgeError::TunnelInactive);
        }
        tokio::time::sleep(state.config.reconnect_poll_interval).await;
        if let Some(binding) = state.registry.get(tunnel_id).await? {
            if binding.status == TunnelStatus::Active {
                return Ok(());
            }
        }
    }
}

enum PollOutcome {
    Buffered {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    Streaming {
        status: u16,
        headers: HashMap<String, String>,
    },
    Staged {
        status: u16,
        headers: HashMap<String, String>,
        key: String,
    },
    Failed {
        status: u16,
        message: String,
    },
    StillPending,
}

/// One snapshot-and-classify step of the poll loop (§4.4 step 6). Streaming
/// responses are reported back as soon as they start so the caller can
/// begin consuming the body immediately; their chunks are drained by a
/// separate producer (`stream_body`), not by this function.
async fn classify(state: &AppState, entry: &PendingRequest) -> Result<PollOutcome, EdgeError> {
    match entry.status {
        PendingStatus::WaitingUpload | PendingStatus::Pending => Ok(PollOutcome::StillPending),
        PendingStatus::Streaming => match &entry.response {
            Some(ResponseView::Streaming { status, headers, .. }) => Ok(PollOutcome::Streaming {
                status: *status,
                headers: headers.clone(),
            }),
            _ => Ok(PollOutcome::StillPending),
        },
        PendingStatus::Failed => match &entry.response {
            Some(ResponseView::Failed { status, message }) => Ok(PollOutcome::Failed {
                status: *status,
                message: message.clone(),
            }),
            _ => Ok(PollOutcome::Failed {
                status: 502,
                message: "agent failure".into(),
            }),
        },
        PendingStatus::Completed => match &entry.response {
            Some(ResponseView::Inline {
                status,
                headers,
                body,
            }) => Ok(PollOutcome::Buffered {
                status: *status,
                headers: headers.clone(),
                body: BASE64.decode(body.as_bytes()).unwrap_or_default(),
            }),
            Some(ResponseView::Staged {
                status,
                headers,
                key,
                ready,
            }) => {
                if *ready {
                    Ok(PollOutcome::Staged {
                        status: *status,
                        headers: headers.clone(),
                        key: key.clone(),
                    })
                } else if state.objects.exists(key).await? {
                    let _ = state.store.patch(&entry.request_id, tunnel_store::Patch::StageReady).await;
                    Ok(PollOutcome::Staged {
                        status: *status,
                        headers: headers.clone(),
                        key: key.clone(),
                    })
                } else {
                    Ok(PollOutcome::StillPending)
                }
            }
            Some(ResponseView::Chunked {
                status,
                headers,
                chunks,
                total_chunks,
            }) => {
                if chunks.len() as u32 >= *total_chunks {
                    let mut body = Vec::new();
                    for idx in 0..*total_chunks {
                        let Some(chunk) = chunks.get(&idx) else {
                            return Ok(PollOutcome::StillPending);
                        };
                        body.extend(BASE64.decode(chunk.as_bytes()).unwrap_or_default());
                    }
                    Ok(PollOutcome::Buffered {
                        status: *status,
                        headers: headers.clone(),
                        body,
                    })
                } else {
                    Ok(PollOutcome::StillPending)
                }
            }
            _ => Ok(PollOutcome::StillPending),
        },
    }
}

fn status_from_u16(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Builds the axum streaming `Body` for an SSE response: a producer that
/// polls the store at the configured cadence, drains contiguous chunks,
/// removes them from the store in one batched patch per tick, and
/// terminates on `stream_done` or the overall deadline (§4.4 step 6,
/// §9 open question 3 — a missing index is simply not-yet-arrived, not a
/// permanent gap, so the loop just waits for it).
fn stream_body(state: AppState, request_id: tunnel_store::RequestId) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    let poll_interval = state.config.poll_interval;
    let deadline = Instant::now() + state.config.poll_deadline;
    tokio::spawn(async move {
        let mut next = 0u32;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll_interval).await;
            let Ok(Some(entry)) = state.store.get(&request_id).await else {
                break;
            };
            let Some(ResponseView::Streaming { chunks, done, .. }) = entry.response else {
                break;
            };
            let (drained, new_next) = crate::ws::drain_contiguous(&chunks, next);
            if !drained.is_empty() {
                next = new_next;
                let _ = state
                    .store
                    .patch(
                        &request_id,
                        tunnel_store::Patch::DrainStreamChunks {
                            up_to_exclusive: next,
                        },
                    )
                    .await;
                for chunk in drained {
                    let bytes = BASE64.decode(chunk.as_bytes()).unwrap_or_default();
                    if tx.send(Ok(Bytes::from(bytes))).await.is_err() {
                        return;
                    }
                }
            }
            if done && chunks.is_empty() {
                break;
            }
        }
    });
    Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx))
}

async fn outcome_into_response(state: &AppState, outcome: PollOutcome) -> Response {
    match outcome {
        PollOutcome::Buffered { status, headers, body } => {
            let mut response = Response::builder().status(status_from_u16(status));
            *response.headers_mut().unwrap() = string_map_to_header_map(&headers);
            response.body(Body::from(body)).unwrap().into_response()
        }
        PollOutcome::Streaming { .. } => unreachable!("streaming handled by caller before this point"),
        PollOutcome::Staged { status, headers, key } => {
            match state.objects.get_bytes(&key).await {
                Ok(bytes) => {
                    let mut response = Response::builder().status(status_from_u16(status));
                    let mut header_map = string_map_to_header_map(&headers);
                    if !header_map.contains_key(axum::http::header::CONTENT_LENGTH) {
                        header_map.insert(
                            axum::http::header::CONTENT_LENGTH,
                            HeaderValue::from_str(&bytes.len().to_string()).unwrap(),
                        );
                    }
                    *response.headers_mut().unwrap() = header_map;
                    response.body(Body::from(bytes)).unwrap().into_response()
                }
                Err(e) => {
                    warn!(error = %e, "failed to fetch staged response object");
                    StatusCode::BAD_GATEWAY.into_response()
                }
            }
        }
        PollOutcome::Failed { status, message } => {
            (status_from_u16(status), message).into_response()
        }
        PollOutcome::StillPending => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

/// `ANY /t/{subdomain}/{*path}` — the synchronous tunneled request (§4.4, §6).
pub async fn tunnel_handler(
    State(state): State<AppState>,
    Path((subdomain, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, EdgeError> {
    let tunnel_id = state
        .resolve_subdomain(&subdomain)
        .ok_or(EdgeError::UnknownSubdomain)?;

    await_active_tunnel(&state, &tunnel_id).await?;

    let request_id = generate_request_id();
    let response_key = objectstore::response_key(request_id.as_str());
    let s3_put_url = state
        .objects
        .presign_put(&response_key, objectstore::DEFAULT_PRESIGN_LIFETIME)
        .await
        .ok();

    let header_map = header_map_to_string_map(&headers);
    let entry = PendingRequest::new_pending(
        request_id.clone(),
        tunnel_id.clone(),
        method.as_str().to_string(),
        format!("/{path}"),
        header_map.clone(),
        None,
    );
    state.store.put(entry).await?;

    if let Err(e) = push_request(
        &state,
        &tunnel_id,
        request_id.as_str(),
        &method,
        &format!("/{path}"),
        &header_map,
        &body,
        s3_put_url,
    )
    .await
    {
        let _ = state
            .store
            .patch(
                &request_id,
                tunnel_store::Patch::Fail {
                    status: 502,
                    message: "failed to deliver request to agent".into(),
                },
            )
            .await;
        return Err(e);
    }

    poll_until_done(&state, &request_id).await
}

/// Marks the pending entry failed if the caller disconnects before
/// `poll_until_done` returns. Axum/hyper cancel a handler's future outright
/// when the client drops the connection — there is no error to catch at
/// that point, only a future that stops running, so the cleanup has to run
/// from `Drop` (§4.4 step 6, §7's "caller disconnected" case).
struct DisconnectGuard {
    state: AppState,
    request_id: tunnel_store::RequestId,
    done: bool,
}

impl DisconnectGuard {
    fn new(state: &AppState, request_id: tunnel_store::RequestId) -> Self {
        Self {
            state: state.clone(),
            request_id,
            done: false,
        }
    }

    fn disarm(&mut self) {
        self.done = true;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!(request_id = %self.request_id, "caller disconnected mid-poll, marking request failed");
        let state = self.state.clone();
        let request_id = self.request_id.clone();
        tokio::spawn(async move {
            let _ = state
                .store
                .patch(
                    &request_id,
                    tunnel_store::Patch::Fail {
                        status: EdgeError::CallerDisconnected.status_code().as_u16(),
                        message: EdgeError::CallerDisconnected.to_string(),
                    },
                )
                .await;
        });
    }
}

/// Drives the poll loop shared by the synchronous tunnel handler and the
/// deferred `/poll/{request_id}` endpoint once a request is known to exist.
/// Wrapped in a `DisconnectGuard` so a caller hanging up mid-poll still
/// marks the entry failed instead of leaving it to linger until TTL.
async fn poll_until_done(
    state: &AppState,
    request_id: &tunnel_store::RequestId,
) -> Result<Response, EdgeError> {
    let mut guard = DisconnectGuard::new(state, request_id.clone());
    let result = poll_until_done_inner(state, request_id).await;
    guard.disarm();
    result
}

async fn poll_until_done_inner(
    state: &AppState,
    request_id: &tunnel_store::RequestId,
) -> Result<Response, EdgeError> {
    let deadline = Instant::now() + state.config.poll_deadline;
    loop {
        let Some(entry) = state.store.get(request_id).await? else {
            return Err(EdgeError::DeadlineExceeded);
        };
        let outcome = classify(state, &entry).await?;
        match outcome {
            PollOutcome::StillPending => {
                if Instant::now() >= deadline {
                    return Err(EdgeError::DeadlineExceeded);
                }
                tokio::time::sleep(state.config.poll_interval).await;
            }
            PollOutcome::Streaming { status, headers } => {
                let mut response = Response::builder().status(status_from_u16(status));
                *response.headers_mut().unwrap() = string_map_to_header_map(&headers);
                return Ok(response
                    .body(stream_body(state.clone(), request_id.clone()))
                    .unwrap());
            }
            other => return Ok(outcome_into_response(state, other).await),
        }
    }
}

#[derive(Deserialize)]
pub struct UploadUrlRequest {
    pub method: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Serialize)]
pub struct UploadUrlResponse {
    pub request_id: String,
    pub upload_url: String,
    pub poll_url: String,
}

/// `POST /upload-url/{subdomain}/{*path}` — deferred-body request (§4.4
/// "Large-inbound side path", §6).
pub async fn upload_url_handler(
    State(state): State<AppState>,
    Path((subdomain, path)): Path<(String, String)>,
    Json(req): Json<UploadUrlRequest>,
) -> Result<Json<UploadUrlResponse>, EdgeError> {
    let tunnel_id = state
        .resolve_subdomain(&subdomain)
        .ok_or(EdgeError::UnknownSubdomain)?;

    let request_id = generate_request_id();
    let key = objectstore::request_key(request_id.as_str());
    let upload_url = state
        .objects
        .presign_put(&key, objectstore::DEFAULT_PRESIGN_LIFETIME)
        .await?;

    let mut headers = req.headers;
    if let Some(ct) = req.content_type {
        headers.insert("content-type".to_string(), ct);
    }

    let mut entry = PendingRequest::new_waiting_upload(
        request_id.clone(),
        tunnel_id,
        req.method,
        headers,
        key,
    );
    entry.path = format!("/{path}");
    state.store.put(entry).await?;

    Ok(Json(UploadUrlResponse {
        request_id: request_id.as_str().to_string(),
        upload_url,
        poll_url: format!("/poll/{request_id}"),
    }))
}

#[derive(Serialize)]
struct PollPending {
    status: &'static str,
}

/// `GET /poll/{request_id}` — poll outcome of a deferred request (§6).
pub async fn poll_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Response, EdgeError> {
    let request_id = tunnel_store::RequestId::from(request_id);
    let Some(entry) = state.store.get(&request_id).await? else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    match entry.status {
        PendingStatus::WaitingUpload => Ok((
            StatusCode::ACCEPTED,
            Json(PollPending {
                status: "waiting_upload",
            }),
        )
            .into_response()),
        PendingStatus::Pending => Ok((
            StatusCode::ACCEPTED,
            Json(PollPending { status: "pending" }),
        )
            .into_response()),
        PendingStatus::Streaming => Ok((
            StatusCode::ACCEPTED,
            Json(PollPending {
                status: "streaming",
            }),
        )
            .into_response()),
        PendingStatus::Completed | PendingStatus::Failed => {
            let outcome = classify(&state, &entry).await?;
            Ok(outcome_into_response(&state, outcome).await)
        }
    }
}

/// `POST /internal/upload-notify/{request_id}` — the upload-notify path's
/// trigger point (§4.6). In a production deployment this is invoked by an
/// object-store event subscription rather than an HTTP call; it is exposed
/// as a route here so the path is reachable and testable without one.
pub async fn upload_notify_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<StatusCode, EdgeError> {
    let request_id = tunnel_store::RequestId::from(request_id);
    crate::ws::handle_upload_notify(&state, &request_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;
    use tunnel_store::{MemoryConnectionRegistry, MemoryObjectStore, MemoryStore};

    fn test_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            reconnect_grace: Duration::from_millis(200),
            reconnect_grace_eligibility: Duration::from_secs(300),
            poll_deadline: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            reconnect_poll_interval: Duration::from_millis(10),
        }
    }

    fn test_state() -> AppState {
        AppState::new(
            std::sync::Arc::new(MemoryStore::new()),
            std::sync::Arc::new(MemoryConnectionRegistry::new()),
            std::sync::Arc::new(MemoryObjectStore::new()),
            test_config(),
        )
    }

    fn sample_entry(request_id: &str) -> PendingRequest {
        PendingRequest::new_pending(
            tunnel_store::RequestId::from(request_id),
            TunnelId::from("t1"),
            "GET".to_string(),
            "/ping".to_string(),
            HashMap::new(),
            None,
        )
    }

    /// Dropping a `DisconnectGuard` without disarming it (simulating the
    /// caller hanging up mid-poll) marks the pending entry failed.
    #[tokio::test]
    async fn disconnect_guard_marks_the_entry_failed_when_dropped_unarmed() {
        let state = test_state();
        let id = tunnel_store::RequestId::from("r1");
        state.store.put(sample_entry("r1")).await.unwrap();

        {
            let _guard = DisconnectGuard::new(&state, id.clone());
            // dropped here without calling disarm()
        }
        // The cleanup patch is applied from a spawned task; give it a tick.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entry = state.store.get(&id).await.unwrap().unwrap();
        assert!(matches!(entry.status, PendingStatus::Failed));
    }

    #[tokio::test]
    async fn disconnect_guard_is_a_no_op_once_disarmed() {
        let state = test_state();
        let id = tunnel_store::RequestId::from("r1");
        state.store.put(sample_entry("r1")).await.unwrap();

        {
            let mut guard = DisconnectGuard::new(&state, id.clone());
            guard.disarm();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entry = state.store.get(&id).await.unwrap().unwrap();
        assert!(matches!(entry.status, PendingStatus::Pending));
    }

    #[tokio::test]
    async fn classify_reports_inline_buffered_response() {
        let state = test_state();
        let id = tunnel_store::RequestId::from("r1");
        state.store.put(sample_entry("r1")).await.unwrap();
        state
            .store
            .patch(
                &id,
                tunnel_store::Patch::CompleteInline {
                    status: 200,
                    headers: HashMap::new(),
                    body: BASE64.encode(b"ok"),
                },
            )
            .await
            .unwrap();

        let entry = state.store.get(&id).await.unwrap().unwrap();
        match classify(&state, &entry).await.unwrap() {
            PollOutcome::Buffered { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, b"ok");
            }
            _ => panic!("expected a buffered outcome"),
        }
    }

    #[tokio::test]
    async fn classify_waits_for_all_response_chunks_before_reassembling() {
        let state = test_state();
        let id = tunnel_store::RequestId::from("r1");
        state.store.put(sample_entry("r1")).await.unwrap();
        state
            .store
            .patch(
                &id,
                tunnel_store::Patch::CompleteChunked {
                    status: 201,
                    headers: HashMap::new(),
                    total_chunks: 2,
                },
            )
            .await
            .unwrap();
        state
            .store
            .patch(
                &id,
                tunnel_store::Patch::AppendResponseChunk {
                    index: 0,
                    data: BASE64.encode(b"hel"),
                },
            )
            .await
            .unwrap();

        let entry = state.store.get(&id).await.unwrap().unwrap();
        assert!(matches!(
            classify(&state, &entry).await.unwrap(),
            PollOutcome::StillPending
        ));

        state
            .store
            .patch(
                &id,
                tunnel_store::Patch::AppendResponseChunk {
                    index: 1,
                    data: BASE64.encode(b"lo"),
                },
            )
            .await
            .unwrap();
        let entry = state.store.get(&id).await.unwrap().unwrap();
        match classify(&state, &entry).await.unwrap() {
            PollOutcome::Buffered { status, body, .. } => {
                assert_eq!(status, 201);
                assert_eq!(body, b"hello");
            }
            _ => panic!("expected a buffered outcome once all chunks arrived"),
        }
    }

    #[tokio::test]
    async fn classify_reports_staged_response_once_object_exists() {
        let state = test_state();
        let id = tunnel_store::RequestId::from("r1");
        state.store.put(sample_entry("r1")).await.unwrap();
        let key = objectstore::response_key("r1");
        state
            .store
            .patch(
                &id,
                tunnel_store::Patch::CompleteStaged {
                    status: 200,
                    headers: HashMap::new(),
                    key: key.clone(),
                },
            )
            .await
            .unwrap();

        let entry = state.store.get(&id).await.unwrap().unwrap();
        assert!(matches!(
            classify(&state, &entry).await.unwrap(),
            PollOutcome::StillPending
        ));

        state.objects.put_bytes(&key, b"video-bytes".to_vec()).await.unwrap();
        let entry = state.store.get(&id).await.unwrap().unwrap();
        match classify(&state, &entry).await.unwrap() {
            PollOutcome::Staged { status, key: k, .. } => {
                assert_eq!(status, 200);
                assert_eq!(k, key);
            }
            _ => panic!("expected a staged outcome once the object exists"),
        }
    }

    #[tokio::test]
    async fn push_request_sends_a_single_inline_frame_for_small_bodies() {
        let state = test_state();
        let tunnel_id = TunnelId::from("t1");
        let conn_id = tunnel_store::ConnectionId::from("c1");
        state.registry.bind(tunnel_id.clone(), conn_id.clone()).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        state.connections.insert(conn_id, tx);

        push_request(
            &state,
            &tunnel_id,
            "r1",
            &Method::GET,
            "/ping",
            &HashMap::new(),
            b"hi",
            None,
        )
        .await
        .unwrap();

        match rx.recv().await.unwrap() {
            Frame::Proxy(p) => {
                assert_eq!(p.total_chunks, 0);
                assert_eq!(BASE64.decode(&p.body).unwrap(), b"hi");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    /// A tunnel that reconnects before the grace window elapses must not
    /// fail the caller's request (§8 scenario S6).
    #[tokio::test]
    async fn await_active_tunnel_succeeds_on_reconnect_within_grace() {
        let state = test_state();
        let tunnel_id = TunnelId::from("t1");
        let old_conn = tunnel_store::ConnectionId::from("c1");
        state.registry.bind(tunnel_id.clone(), old_conn.clone()).await.unwrap();
        state.registry.unbind(&old_conn).await.unwrap();

        let registry = state.registry.clone();
        let reconnect_tunnel = tunnel_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let new_conn = tunnel_store::ConnectionId::from("c2");
            let _ = registry.bind(reconnect_tunnel, new_conn).await;
        });

        await_active_tunnel(&state, &tunnel_id).await.unwrap();
    }

    /// A tunnel that never reconnects must fail once the grace window
    /// elapses, rather than wait forever (§8 scenario S6, negative case).
    #[tokio::test]
    async fn await_active_tunnel_fails_once_grace_elapses_without_reconnect() {
        let state = test_state();
        let tunnel_id = TunnelId::from("t1");
        let conn = tunnel_store::ConnectionId::from("c1");
        state.registry.bind(tunnel_id.clone(), conn.clone()).await.unwrap();
        state.registry.unbind(&conn).await.unwrap();

        let err = await_active_tunnel(&state, &tunnel_id).await.unwrap_err();
        assert!(matches!(err, EdgeError::TunnelInactive));
    }

    #[tokio::test]
    async fn push_request_chunks_bodies_larger_than_fchunk() {
        let state = test_state();
        let tunnel_id = TunnelId::from("t1");
        let conn_id = tunnel_store::ConnectionId::from("c1");
        state.registry.bind(tunnel_id.clone(), conn_id.clone()).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        state.connections.insert(conn_id, tx);

        let body = vec![7u8; FCHUNK * 2 + 10];
        push_request(
            &state,
            &tunnel_id,
            "r1",
            &Method::POST,
            "/upload",
            &HashMap::new(),
            &body,
            None,
        )
        .await
        .unwrap();

        let mut chunk_count = 0;
        loop {
            match rx.recv().await.unwrap() {
                Frame::ProxyChunk(_) => chunk_count += 1,
                Frame::Proxy(p) => {
                    assert_eq!(p.total_chunks, 3);
                    break;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(chunk_count, 3);
    }
}
