//! # Control Channel Connection Loop
//!
//! Maintains the persistent WebSocket connection to the edge (§4.5). One
//! reader task drives this function; a worker is spawned per inbound
//! `proxy` frame, and all outbound writes funnel through a single mpsc
//! channel drained by one writer task, since the channel forbids
//! concurrent writers (§5).

use std::sync::Arc;

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use tunnel_protocol::Frame;

use crate::config::Config;
use crate::reassembly::ReassemblyBuffers;
use crate::worker::{self, RequestContext};

/// Runs the control channel forever, reconnecting with a fixed delay on
/// any read/write error (§4.5 "tear down and reconnect with bounded
/// backoff"). Never returns.
pub async fn run(config: Config) {
    let http = reqwest::Client::new();
    loop {
        info!(url = %config.edge_url, "connecting to edge");
        match tokio_tungstenite::connect_async(config.control_url()).await {
            Ok((ws, _response)) => {
                info!("control channel established");
                run_connected(&config, &http, ws).await;
                warn!("control channel disconnected");
            }
            Err(e) => {
                error!(error = %e, "failed to connect to edge");
            }
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn run_connected(
    config: &Config,
    http: &reqwest::Client,
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) {
    let (ws_sink, mut ws_stream) = ws.split();
    let ws_sink = Arc::new(tokio::sync::Mutex::new(ws_sink));
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let reassembly = Arc::new(ReassemblyBuffers::new());

    let outbound_sink = ws_sink.clone();
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to serialize frame");
                    continue;
                }
            };
            let mut sink = outbound_sink.lock().await;
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_tx = tx.clone();
    let heartbeat_interval = config.heartbeat_interval;
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::time::sleep(heartbeat_interval).await;
            if heartbeat_tx.send(Frame::Ping).is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => {
                    dispatch(config, http, &tx, &reassembly, frame);
                }
                Err(e) => warn!(error = %e, "dropping malformed frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "control channel read error");
                break;
            }
        }
    }

    outbound.abort();
    heartbeat.abort();
    reassembly.clear();
}

/// Dispatches one inbound frame (§4.5 step 1). Only `proxy`/`proxy_chunk`
/// and `pong` ever arrive on this side; anything else is a protocol
/// violation from a misbehaving edge and is logged and dropped (§7).
fn dispatch(
    config: &Config,
    http: &reqwest::Client,
    tx: &mpsc::UnboundedSender<Frame>,
    reassembly: &Arc<ReassemblyBuffers>,
    frame: Frame,
) {
    match frame {
        Frame::Ping => {
            let _ = tx.send(Frame::Pong);
        }
        Frame::Pong => {}

        Frame::Proxy(req) => {
            if let Some(get_url) = req.s3_request_get_url.clone() {
                spawn_staged_fetch(config.clone(), http.clone(), tx.clone(), req, get_url);
                return;
            }
            if req.total_chunks > 0 {
                // Terminal frame for a chunked body: method/path/headers
                // travel here, the body was accumulated from the
                // `proxy_chunk` frames that preceded it.
                match reassembly.take_assembled(&req.request_id, req.total_chunks) {
                    Some(body) => spawn_worker(
                        config.clone(),
                        http.clone(),
                        tx.clone(),
                        RequestContext {
                            request_id: req.request_id,
                            method: req.method,
                            path: req.path,
                            headers: req.headers,
                            body,
                            s3_put_url: req.s3_put_url,
                        },
                    ),
                    None => warn!(request_id = %req.request_id, "terminal frame arrived before all chunks"),
                }
                return;
            }
            let body = base64::engine::general_purpose::STANDARD
                .decode(&req.body)
                .unwrap_or_default();
            spawn_worker(
                config.clone(),
                http.clone(),
                tx.clone(),
                RequestContext {
                    request_id: req.request_id,
                    method: req.method,
                    path: req.path,
                    headers: req.headers,
                    body,
                    s3_put_url: req.s3_put_url,
                },
            );
        }

        Frame::ProxyChunk(chunk) => {
            reassembly.add_chunk(&chunk.request_id, chunk.chunk_index, &chunk.data);
        }

        Frame::ProxyResponse(_)
        | Frame::ProxyResponseChunk(_)
        | Frame::ProxyStreamStart(_)
        | Frame::ProxyStreamChunk(_)
        | Frame::ProxyStreamEnd(_) => {
            warn!("dropping agent-bound-only frame received on an agent connection");
        }
    }
}

fn spawn_worker(
    config: Config,
    http: reqwest::Client,
    tx: mpsc::UnboundedSender<Frame>,
    ctx: RequestContext,
) {
    tokio::spawn(async move {
        worker::handle_request(http, &config, tx, ctx).await;
    });
}

/// Fetches a deferred request body from the object store via its
/// presigned GET handle (upload-notify rejoin point, §4.6) before running
/// the same local-call path as an inline request.
fn spawn_staged_fetch(
    config: Config,
    http: reqwest::Client,
    tx: mpsc::UnboundedSender<Frame>,
    req: tunnel_protocol::ProxyRequest,
    get_url: String,
) {
    tokio::spawn(async move {
        let body = match http.get(get_url.as_str()).send().await {
            Ok(resp) => resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default(),
            Err(e) => {
                error!(request_id = %req.request_id, error = %e, "failed to fetch staged request body");
                Vec::new()
            }
        };
        worker::handle_request(
            http,
            &config,
            tx,
            RequestContext {
                request_id: req.request_id,
                method: req.method,
                path: req.path,
                headers: req.headers,
                body,
                s3_put_url: req.s3_put_url,
            },
        )
        .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::ProxyRequest;

    fn test_config(local_port: u16) -> Config {
        Config {
            edge_url: String::new(),
            tunnel_id: String::new(),
            token: String::new(),
            local_port,
            heartbeat_interval: std::time::Duration::from_secs(30),
            reconnect_delay: std::time::Duration::from_secs(3),
            call_timeout: std::time::Duration::from_secs(2),
        }
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let config = test_config(0);
        let http = reqwest::Client::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let reassembly = Arc::new(ReassemblyBuffers::new());

        dispatch(&config, &http, &tx, &reassembly, Frame::Ping);

        assert!(matches!(rx.recv().await, Some(Frame::Pong)));
    }

    #[tokio::test]
    async fn chunked_proxy_frame_assembles_before_spawning_a_worker() {
        let port = closed_port().await;
        let config = test_config(port);
        let http = reqwest::Client::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let reassembly = Arc::new(ReassemblyBuffers::new());

        dispatch(
            &config,
            &http,
            &tx,
            &reassembly,
            Frame::ProxyChunk(tunnel_protocol::Chunk {
                request_id: "r1".to_string(),
                chunk_index: 0,
                data: "aGVs".to_string(),
            }),
        );
        dispatch(
            &config,
            &http,
            &tx,
            &reassembly,
            Frame::ProxyChunk(tunnel_protocol::Chunk {
                request_id: "r1".to_string(),
                chunk_index: 1,
                data: "bG8=".to_string(),
            }),
        );
        dispatch(
            &config,
            &http,
            &tx,
            &reassembly,
            Frame::Proxy(ProxyRequest {
                request_id: "r1".to_string(),
                method: "POST".to_string(),
                path: "/echo".to_string(),
                headers: std::collections::HashMap::new(),
                body: String::new(),
                total_chunks: 2,
                s3_put_url: None,
                s3_request_get_url: None,
            }),
        );

        // The worker spawned against a closed local port fails the local
        // call and reports it as a proxy_response rather than hanging.
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("worker responded before timeout")
            .expect("a frame was sent");
        match frame {
            Frame::ProxyResponse(r) => assert_eq!(r.request_id, "r1"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn edge_bound_frames_are_dropped_without_panicking() {
        let config = test_config(0);
        let http = reqwest::Client::new();
        let (tx, _rx) = mpsc::unbounded_channel::<Frame>();
        let reassembly = Arc::new(ReassemblyBuffers::new());

        dispatch(
            &config,
            &http,
            &tx,
            &reassembly,
            Frame::ProxyResponse(tunnel_protocol::ProxyResponse {
                request_id: "r1".to_string(),
                status_code: 200,
                response_headers: std::collections::HashMap::new(),
                response_body: String::new(),
                total_chunks: None,
                s3_response_key: None,
            }),
        );
    }
}
