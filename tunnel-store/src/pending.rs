//! # Pending-Request Store
//!
//! Persistent mapping from `request_id` to request/response state (§3, §4.1).
//! Write amplification dominates the streaming path, so `patch` is modeled as
//! a small set of named, atomic, single-item operations rather than a
//! read-modify-write of the whole entry — this is what lets a
//! `proxy_stream_chunk` arriving at 50ms cadence avoid serializing the
//! entire response body on every tick.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::error::StoreError;
use crate::ids::{RequestId, TunnelId};

/// Default TTL for a buffered/streaming pending request: 5 minutes (§5).
pub const TTL_BUFFERED_MS: u64 = 5 * 60 * 1000;
/// TTL for an entry awaiting a deferred upload: 30 minutes (§5).
pub const TTL_WAITING_UPLOAD_MS: u64 = 30 * 60 * 1000;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Lifecycle status of a pending request (§3, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    WaitingUpload,
    Pending,
    Streaming,
    Completed,
    Failed,
}

/// The response view, once one exists. Modeled as a tagged variant per the
/// design notes rather than inheritance: a request carries **exactly one**
/// of these once it transitions out of `pending` (§3 invariants, §8 property 2).
#[derive(Debug, Clone)]
pub enum ResponseView {
    Inline {
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
    Streaming {
        status: u16,
        headers: HashMap<String, String>,
        /// Dense-from-zero chunk index → payload. Entries are removed by the
        /// edge as they're consumed (§4.4 step 6, §9 open question 3).
        chunks: BTreeMap<u32, String>,
        done: bool,
    },
    Staged {
        status: u16,
        headers: HashMap<String, String>,
        key: String,
        ready: bool,
    },
    /// A terminal response whose body arrived as `proxy_response_chunk`
    /// frames rather than inline or staged; reassembled the same way a
    /// streaming response's chunks are, but is not itself "streaming" status.
    Chunked {
        status: u16,
        headers: HashMap<String, String>,
        chunks: BTreeMap<u32, String>,
        total_chunks: u32,
    },
    Failed {
        status: u16,
        message: String,
    },
}

/// A single pending request (§3).
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub tunnel_id: TunnelId,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub s3_request_key: Option<String>,
    pub status: PendingStatus,
    pub response: Option<ResponseView>,
    pub created_at_ms: u64,
    pub ttl_ms: u64,
}

impl PendingRequest {
    pub fn new_pending(
        request_id: RequestId,
        tunnel_id: TunnelId,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Option<String>,
    ) -> Self {
        let created_at_ms = now_ms();
        Self {
            request_id,
            tunnel_id,
            method,
            path,
            headers,
            body,
            s3_request_key: None,
            status: PendingStatus::Pending,
            response: None,
            created_at_ms,
            ttl_ms: created_at_ms + TTL_BUFFERED_MS,
        }
    }

    pub fn new_waiting_upload(
        request_id: RequestId,
        tunnel_id: TunnelId,
        method: String,
        headers: HashMap<String, String>,
        s3_request_key: String,
    ) -> Self {
        let created_at_ms = now_ms();
        Self {
            request_id,
            tunnel_id,
            method,
            path: String::new(),
            headers,
            body: None,
            s3_request_key: Some(s3_request_key),
            status: PendingStatus::WaitingUpload,
            response: None,
            created_at_ms,
            ttl_ms: created_at_ms + TTL_WAITING_UPLOAD_MS,
        }
    }

    pub fn is_expired(&self) -> bool {
        now_ms() > self.ttl_ms
    }
}

/// The set of legal atomic mutations a dispatcher, upload-notify handler, or
/// edge poll loop may apply to a pending entry. Each corresponds to exactly
/// one place in §4.4/§4.6 that writes to the store.
#[derive(Debug, Clone)]
pub enum Patch {
    /// Upload-notify: `waiting_upload` → `pending`, body now fetched via a
    /// presigned GET rather than inline (§4.6).
    UploadReady { s3_request_key: String },
    /// Terminal inline response (§4.6 `proxy_response`).
    CompleteInline {
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
    /// Terminal response staged in the object store.
    CompleteStaged {
        status: u16,
        headers: HashMap<String, String>,
        key: String,
    },
    /// Terminal response whose body will arrive as response-chunk frames.
    CompleteChunked {
        status: u16,
        headers: HashMap<String, String>,
        total_chunks: u32,
    },
    /// Marks a staged response's object as uploaded and readable.
    StageReady,
    /// One `proxy_response_chunk` frame, appended to a `Chunked` response view.
    AppendResponseChunk { index: u32, data: String },
    /// `proxy_stream_start`: transitions `pending` → `streaming`.
    StreamStart {
        status: u16,
        headers: HashMap<String, String>,
    },
    /// One SSE event.
    AppendStreamChunk { index: u32, data: String },
    /// `proxy_stream_end`: no more chunks will arrive.
    StreamEnd,
    /// The edge's poll loop has consumed chunks `0..up_to_exclusive` and
    /// asks the store to drop them in one batched write per tick.
    DrainStreamChunks { up_to_exclusive: u32 },
    /// An agent-side transport failure or non-2xx is still a valid response
    /// per §7, but a true failure (agent unreachable) lands here.
    Fail { status: u16, message: String },
}

#[async_trait]
pub trait PendingRequestStore: Send + Sync {
    /// Creates a new entry. Fails with `AlreadyExists` if the key is taken.
    async fn put(&self, entry: PendingRequest) -> Result<(), StoreError>;

    /// Returns the entry, or `None` if absent or expired (§4.1 `Expire`).
    async fn get(&self, id: &RequestId) -> Result<Option<PendingRequest>, StoreError>;

    /// Applies one atomic mutation. No prior read is required (§4.1).
    async fn patch(&self, id: &RequestId, patch: Patch) -> Result<(), StoreError>;

    /// Drops all entries whose TTL has passed; returns how many were removed.
    async fn expire_sweep(&self) -> Result<u64, StoreError>;
}

/// `DashMap`-backed store: the default for single-process deployments and
/// for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<RequestId, PendingRequest>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_patch(entry: &mut PendingRequest, patch: Patch) {
        match patch {
            Patch::UploadReady { s3_request_key } => {
                entry.status = PendingStatus::Pending;
                entry.s3_request_key = Some(s3_request_key);
            }
            Patch::CompleteInline {
                status,
                headers,
                body,
            } => {
                entry.status = PendingStatus::Completed;
                entry.response = Some(ResponseView::Inline {
                    status,
                    headers,
                    body,
                });
            }
            Patch::CompleteStaged {
                status,
                headers,
                key,
            } => {
                entry.status = PendingStatus::Completed;
                entry.response = Some(ResponseView::Staged {
                    status,
                    headers,
                    key,
                    ready: false,
                });
            }
            Patch::CompleteChunked {
                status,
                headers,
                total_chunks,
            } => {
                entry.status = PendingStatus::Completed;
                entry.response = Some(ResponseView::Chunked {
                    status,
                    headers,
                    chunks: BTreeMap::new(),
                    total_chunks,
                });
            }
            Patch::StageReady => {
                if let Some(ResponseView::Staged { ready, .. }) = entry.response.as_mut() {
                    *ready = true;
                }
            }
            Patch::AppendResponseChunk { index, data } => {
                if let Some(ResponseView::Chunked { chunks, .. }) = entry.response.as_mut() {
                    chunks.insert(index, data);
                }
            }
            Patch::StreamStart { status, headers } => {
                // A late or duplicate stream_start must never demote an
                // already-terminal entry back to `Streaming` (§8 invariant 6).
                if matches!(entry.status, PendingStatus::Completed | PendingStatus::Failed) {
                    trace!(request_id = %entry.request_id, "dropping stream_start on terminal entry");
                    return;
                }
                entry.status = PendingStatus::Streaming;
                entry.response = Some(ResponseView::Streaming {
                    status,
                    headers,
                    chunks: BTreeMap::new(),
                    done: false,
                });
            }
            Patch::AppendStreamChunk { index, data } => {
                if let Some(ResponseView::Streaming { chunks, .. }) = entry.response.as_mut() {
                    chunks.insert(index, data);
                }
            }
            Patch::StreamEnd => {
                if let Some(ResponseView::Streaming { done, .. }) = entry.response.as_mut() {
                    *done = true;
                }
                if matches!(entry.status, PendingStatus::Streaming) {
                    entry.status = PendingStatus::Completed;
                }
            }
            Patch::DrainStreamChunks { up_to_exclusive } => {
                if let Some(ResponseView::Streaming { chunks, .. }) = entry.response.as_mut() {
                    chunks.retain(|idx, _| *idx >= up_to_exclusive);
                }
            }
            Patch::Fail { status, message } => {
                // A late failure (e.g. a disconnect detected after the agent
                // already answered) must not override a terminal entry
                // (§8 invariant 6).
                if matches!(entry.status, PendingStatus::Completed | PendingStatus::Failed) {
                    trace!(request_id = %entry.request_id, "dropping fail patch on terminal entry");
                    return;
                }
                entry.status = PendingStatus::Failed;
                entry.response = Some(ResponseView::Failed { status, message });
            }
        }
    }
}

#[async_trait]
impl PendingRequestStore for MemoryStore {
    async fn put(&self, entry: PendingRequest) -> Result<(), StoreError> {
        match self.entries.entry(entry.request_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(entry);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &RequestId) -> Result<Option<PendingRequest>, StoreError> {
        match self.entries.get(id) {
            Some(e) if e.is_expired() => {
                drop(e);
                self.entries.remove(id);
                Ok(None)
            }
            Some(e) => Ok(Some(e.clone())),
            None => Ok(None),
        }
    }

    async fn patch(&self, id: &RequestId, patch: Patch) -> Result<(), StoreError> {
        match self.entries.get_mut(id) {
            Some(mut e) => {
                Self::apply_patch(&mut e, patch);
                Ok(())
            }
            // A patch racing an expiry sweep (or a late frame for an
            // already-gone entry) is dropped, not an error: the dispatcher
            // logs and moves on per the integrity-error handling in §7.
            None => {
                trace!(request_id = %id, "patch on missing entry, dropping");
                Ok(())
            }
        }
    }

    async fn expire_sweep(&self) -> Result<u64, StoreError> {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|e| e.is_expired())
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len() as u64;
        for id in expired {
            self.entries.remove(&id);
        }
        Ok(count)
    }
}
