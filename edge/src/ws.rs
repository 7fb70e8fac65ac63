//! # Control Channel: Upgrade, Connection Lifecycle, and Dispatcher
//!
//! This module hosts the WebSocket side of the control channel (§4.3) and,
//! because the socket lives in this same process, the Dispatcher (§4.6) is
//! simply the inbound arm of that connection's message loop — it still only
//! ever talks to the rest of the system through the Pending-Request Store,
//! exactly as if it were a separately-deployed function reacting to a push
//! frame.
//!
//! One task drains an outbound queue and owns the WebSocket sink (the
//! channel forbids concurrent writers, §5), the current task reads inbound
//! frames, and disconnect triggers the connection-lifecycle unbind hook
//! (§4.2, §4.7).

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use tunnel_protocol::Frame;
use tunnel_store::{ConnectionId, Patch, RequestId, TunnelId};

use crate::auth::CredentialVerifier;
use crate::state::AppState;

#[derive(serde::Deserialize)]
pub struct ConnectQuery {
    pub tunnel_id: String,
    pub token: String,
}

/// `GET /control` — upgrades to the control-channel WebSocket (§4.3, §6).
///
/// The pre-connect authorizer runs here, before the upgrade completes: a
/// missing or invalid credential never reaches the registry bind step.
pub async fn connect_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    State(verifier): State<Arc<dyn CredentialVerifier>>,
    Query(q): Query<ConnectQuery>,
) -> impl IntoResponse {
    let tunnel_id = TunnelId::from(q.tunnel_id);
    if !verifier.verify(&tunnel_id, &q.token).await {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state, tunnel_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, tunnel_id: TunnelId) {
    let conn_id = ConnectionId::from(uuid::Uuid::new_v4().to_string());
    info!(%conn_id, %tunnel_id, "control channel connected");

    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    state.connections.insert(conn_id.clone(), tx.clone());
    // Connection hook: bind (§4.2). A reconnect from the same tunnel_id
    // atomically replaces whatever connection_id was bound before, which is
    // what ends any edge handler's in-flight reconnect-grace wait (§4.5).
    if let Err(e) = state.registry.bind(tunnel_id.clone(), conn_id.clone()).await {
        warn!(error = %e, "failed to bind connection");
    }

    let ws_sink = Arc::new(Mutex::new(ws_sink));
    let ws_sink_clone = ws_sink.clone();
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to serialize frame");
                    continue;
                }
            };
            let mut sink = ws_sink_clone.lock().await;
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => dispatch_frame(&state, &tx, frame).await,
                Err(e) => warn!(error = %e, "dropping malformed frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(%conn_id, "control channel disconnected");
    outbound.abort();
    state.connections.remove(&conn_id);
    let _ = state.registry.unbind(&conn_id).await;
}

/// Dispatcher (§4.6): applies one inbound frame to the Pending-Request
/// Store. Unknown actions are logged and dropped, never surfaced to the
/// agent or the waiting Edge Handler (§7 "integrity errors").
async fn dispatch_frame(state: &AppState, tx: &mpsc::UnboundedSender<Frame>, frame: Frame) {
    match frame {
        Frame::Ping => {
            let _ = tx.send(Frame::Pong);
        }
        Frame::Pong => {}

        Frame::ProxyResponse(r) => {
            let id = RequestId::from(r.request_id.clone());
            let patch = if let Some(key) = r.s3_response_key {
                Patch::CompleteStaged {
                    status: r.status_code,
                    headers: r.response_headers,
                    key,
                }
            } else if let Some(total_chunks) = r.total_chunks {
                Patch::CompleteChunked {
                    status: r.status_code,
                    headers: r.response_headers,
                    total_chunks,
                }
            } else {
                Patch::CompleteInline {
                    status: r.status_code,
                    headers: r.response_headers,
                    body: r.response_body,
                }
            };
            if let Err(e) = state.store.patch(&id, patch).await {
                warn!(error = %e, request_id = %id, "failed to patch proxy_response");
            }
        }

        Frame::ProxyResponseChunk(c) => {
            let id = RequestId::from(c.request_id.clone());
            let _ = state
                .store
                .patch(
                    &id,
                    Patch::AppendResponseChunk {
                        index: c.chunk_index,
                        data: c.data,
                    },
                )
                .await;
        }

        Frame::ProxyStreamStart(s) => {
            let id = RequestId::from(s.request_id.clone());
            let _ = state
                .store
                .patch(
                    &id,
                    Patch::StreamStart {
                        status: s.status_code,
                        headers: s.response_headers,
                    },
                )
                .await;
        }

        Frame::ProxyStreamChunk(c) => {
            let id = RequestId::from(c.request_id.clone());
            let _ = state
                .store
                .patch(
                    &id,
                    Patch::AppendStreamChunk {
                        index: c.chunk_index,
                        data: c.data,
                    },
                )
                .await;
        }

        Frame::ProxyStreamEnd(e) => {
            let id = RequestId::from(e.request_id.clone());
            let _ = state.store.patch(&id, Patch::StreamEnd).await;
        }

        // These only ever flow edge → agent; receiving one here is a
        // protocol violation from a misbehaving client.
        Frame::Proxy(_) | Frame::ProxyChunk(_) => {
            warn!("dropping edge-bound frame received from an agent connection");
        }
    }
}

/// Upload-notify path (§4.6): fired when an object lands under
/// `requests/{request_id}/body`. Not a control-channel frame — a separate
/// ingress event from the object store, modeled here as a plain function so
/// any trigger (HTTP webhook, queue consumer, polling) can call it.
pub async fn handle_upload_notify(
    state: &AppState,
    request_id: &RequestId,
) -> Result<(), crate::error::EdgeError> {
    let Some(entry) = state.store.get(request_id).await? else {
        return Ok(());
    };
    let Some(key) = entry.s3_request_key.clone() else {
        return Ok(());
    };

    state
        .store
        .patch(
            request_id,
            Patch::UploadReady {
                s3_request_key: key.clone(),
            },
        )
        .await?;

    let lifetime = tunnel_store::objectstore::DEFAULT_PRESIGN_LIFETIME;
    let get_url = state.objects.presign_get(&key, lifetime).await?;

    if let Some(binding) = state.registry.get(&entry.tunnel_id).await? {
        if let Some(conn_id) = binding.connection_id {
            if let Some(tx) = state.connections.get(&conn_id) {
                let frame = Frame::Proxy(tunnel_protocol::ProxyRequest {
                    request_id: request_id.as_str().to_string(),
                    method: entry.method,
                    path: entry.path,
                    headers: entry.headers,
                    body: String::new(),
                    total_chunks: 0,
                    s3_put_url: None,
                    s3_request_get_url: Some(get_url),
                });
                let _ = tx.send(frame);
            }
        }
    }
    Ok(())
}

/// Reassembles a response's dense-from-zero chunk map into a single body,
/// consuming (and asking the store to drop) each chunk in order. Shared by
/// the streaming producer and the chunked-terminal-response path (§4.4).
pub fn drain_contiguous(chunks: &BTreeMap<u32, String>, next: u32) -> (Vec<String>, u32) {
    let mut out = Vec::new();
    let mut idx = next;
    while let Some(chunk) = chunks.get(&idx) {
        out.push(chunk.clone());
        idx += 1;
    }
    (out, idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_contiguous_stops_at_first_gap() {
        let mut chunks = BTreeMap::new();
        chunks.insert(0, "a".to_string());
        chunks.insert(1, "b".to_string());
        chunks.insert(3, "d".to_string());
        let (out, next) = drain_contiguous(&chunks, 0);
        assert_eq!(out, vec!["a", "b"]);
        assert_eq!(next, 2);
    }
}
