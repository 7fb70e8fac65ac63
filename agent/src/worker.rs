//! # Per-Request Worker
//!
//! One task per inbound `proxy` frame (§4.5, §5 "one worker task per
//! inbound proxy"). Issues the local HTTP call and selects the outbound
//! response mode: SSE passthrough, staged-via-object-store, chunked, or a
//! single inline frame.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, warn};
use tunnel_protocol::{Chunk, Frame, ProxyResponse, StreamEnd, StreamStart, FCHUNK, FMAX, FSTAGE};

use crate::config::Config;
use crate::error::AgentError;

const BINARY_CONTENT_TYPES: &[&str] = &["video/", "audio/", "image/", "application/octet-stream", "application/pdf", "application/zip"];

pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: std::collections::HashMap<String, String>,
    pub body: Vec<u8>,
    /// Presigned PUT handle for a staged response, if the edge offered one.
    pub s3_put_url: Option<String>,
}

fn is_binary_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    BINARY_CONTENT_TYPES.iter().any(|prefix| ct.starts_with(prefix))
}

fn header_map_to_string_map(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

fn string_map_to_header_map(headers: &std::collections::HashMap<String, String>) -> HeaderMap {
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

/// Handles one proxied request end to end: local call, response-mode
/// selection, and emitting the matching frame(s) (§4.5 steps 2-3).
pub async fn handle_request(
    client: reqwest::Client,
    config: &Config,
    tx: UnboundedSender<Frame>,
    ctx: RequestContext,
) {
    let url = format!("http://localhost:{}{}", config.local_port, ctx.path);
    let method = match reqwest::Method::from_bytes(ctx.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            warn!(method = %ctx.method, "unsupported HTTP method");
            send_failure(&tx, &ctx.request_id, 400, "unsupported method");
            return;
        }
    };

    let request = client
        .request(method, url)
        .headers(string_map_to_header_map(&ctx.headers))
        .body(ctx.body)
        .timeout(config.call_timeout);

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            error!(request_id = %ctx.request_id, error = %e, "local call failed");
            send_failure(&tx, &ctx.request_id, 502, &e.to_string());
            return;
        }
    };

    let status = response.status().as_u16();
    let headers = header_map_to_string_map(response.headers());
    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_default();

    if content_type.starts_with("text/event-stream") {
        stream_sse(response, &tx, &ctx.request_id, status, headers).await;
        return;
    }

    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            error!(request_id = %ctx.request_id, error = %e, "failed to read local response body");
            send_failure(&tx, &ctx.request_id, 502, &e.to_string());
            return;
        }
    };

    if estimated_inline_frame_size(&body) > FMAX
        && ctx.s3_put_url.is_some()
        && (body.len() > FSTAGE || is_binary_content_type(&content_type))
    {
        if let Some(put_url) = &ctx.s3_put_url {
            match stage_body(&client, put_url, &body).await {
                Ok(key) => {
                    let _ = tx.send(Frame::ProxyResponse(ProxyResponse {
                        request_id: ctx.request_id.clone(),
                        status_code: status,
                        response_headers: headers,
                        response_body: String::new(),
                        total_chunks: None,
                        s3_response_key: Some(key),
                    }));
                    return;
                }
                Err(e) => {
                    warn!(request_id = %ctx.request_id, error = %e, "staging failed, falling back to chunked response");
                }
            }
        }
    }

    if estimated_inline_frame_size(&body) > FMAX {
        send_chunked(&tx, &ctx.request_id, status, headers, &body);
    } else {
        let _ = tx.send(Frame::ProxyResponse(ProxyResponse {
            request_id: ctx.request_id.clone(),
            status_code: status,
            response_headers: headers,
            response_body: BASE64.encode(&body),
            total_chunks: None,
            s3_response_key: None,
        }));
    }
}

fn estimated_inline_frame_size(body: &[u8]) -> usize {
    // Base64 inflates by ~4/3; this is an estimate of the serialized
    // frame size used to decide whether to chunk (§4.5 step 3).
    (body.len() * 4) / 3 + 64
}

fn send_failure(tx: &UnboundedSender<Frame>, request_id: &str, status: u16, message: &str) {
    let _ = tx.send(Frame::ProxyResponse(ProxyResponse {
        request_id: request_id.to_string(),
        status_code: status,
        response_headers: std::collections::HashMap::new(),
        response_body: BASE64.encode(message.as_bytes()),
        total_chunks: None,
        s3_response_key: None,
    }));
}

fn send_chunked(
    tx: &UnboundedSender<Frame>,
    request_id: &str,
    status: u16,
    headers: std::collections::HashMap<String, String>,
    body: &Bytes,
) {
    let chunks: Vec<&[u8]> = body.chunks(FCHUNK).collect();
    for (index, chunk) in chunks.iter().enumerate() {
        let _ = tx.send(Frame::ProxyResponseChunk(Chunk {
            request_id: request_id.to_string(),
            chunk_index: index as u32,
            data: BASE64.encode(chunk),
        }));
    }
    let _ = tx.send(Frame::ProxyResponse(ProxyResponse {
        request_id: request_id.to_string(),
        status_code: status,
        response_headers: headers,
        response_body: String::new(),
        total_chunks: Some(chunks.len() as u32),
        s3_response_key: None,
    }));
}

async fn stage_body(client: &reqwest::Client, put_url: &str, body: &Bytes) -> Result<String, AgentError> {
    client
        .put(put_url)
        .body(body.clone())
        .send()
        .await
        .map_err(|e| AgentError::ObjectTransfer(e.to_string()))?
        .error_for_status()
        .map_err(|e| AgentError::ObjectTransfer(e.to_string()))?;
    // The presigned URL's path component is the object key; the edge
    // already knows it (it minted the URL), so the agent only needs to
    // confirm the PUT succeeded. Re-deriving the key from the URL keeps
    // proxy_response self-describing without the edge having to remember
    // which key it handed out for which request.
    let key = reqwest::Url::parse(put_url)
        .map(|u| u.path().trim_start_matches('/').to_string())
        .unwrap_or_default();
    Ok(key)
}

/// SSE passthrough (§4.5 step 3): reads the local response body as a byte
/// stream, splits it on blank-line-terminated SSE events, and forwards
/// each as its own `proxy_stream_chunk` with a monotonically increasing
/// index.
async fn stream_sse(
    response: reqwest::Response,
    tx: &UnboundedSender<Frame>,
    request_id: &str,
    status: u16,
    headers: std::collections::HashMap<String, String>,
) {
    let _ = tx.send(Frame::ProxyStreamStart(StreamStart {
        request_id: request_id.to_string(),
        status_code: status,
        response_headers: headers,
    }));

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut index = 0u32;
    loop {
        match tokio::time::timeout(Duration::from_secs(180), stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos + 2].to_string();
                    buffer.drain(..pos + 2);
                    let _ = tx.send(Frame::ProxyStreamChunk(Chunk {
                        request_id: request_id.to_string(),
                        chunk_index: index,
                        data: BASE64.encode(event.as_bytes()),
                    }));
                    index += 1;
                }
            }
            Ok(Some(Err(e))) => {
                warn!(request_id, error = %e, "SSE stream read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(request_id, "SSE stream idle timeout");
                break;
            }
        }
    }
    if !buffer.is_empty() {
        let _ = tx.send(Frame::ProxyStreamChunk(Chunk {
            request_id: request_id.to_string(),
            chunk_index: index,
            data: BASE64.encode(buffer.as_bytes()),
        }));
    }
    let _ = tx.send(Frame::ProxyStreamEnd(StreamEnd {
        request_id: request_id.to_string(),
    }));
}
