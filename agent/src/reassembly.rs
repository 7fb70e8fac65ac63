//! # Request Body Reassembly Buffers
//!
//! Keyed by `request_id` (§4.5): the edge sends `proxy_chunk[0..N-1]`
//! frames first and only then a terminal `proxy` frame carrying
//! `total_chunks` (body empty) with the request's method/path/headers.
//! Chunks are decoded from base64 and accumulated as they arrive, with no
//! need to know `total_chunks` in advance; the terminal frame's arrival is
//! what triggers assembly. Entries are deleted on assembly or on
//! connection teardown, never left to grow unbounded across reconnects.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

#[derive(Default)]
pub struct ReassemblyBuffers {
    inner: Mutex<HashMap<String, HashMap<u32, Vec<u8>>>>,
}

impl ReassemblyBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one base64-encoded chunk, decoding it immediately — base64
    /// fragments of a split body can't be concatenated as text and
    /// re-decoded, since chunk boundaries rarely land on 3-byte alignment.
    /// A chunk that fails to decode is dropped silently.
    pub fn add_chunk(&self, request_id: &str, index: u32, data: &str) {
        let Ok(bytes) = BASE64.decode(data) else {
            return;
        };
        self.inner
            .lock()
            .unwrap()
            .entry(request_id.to_string())
            .or_default()
            .insert(index, bytes);
    }

    /// Assembles and removes the buffer for `request_id` once the terminal
    /// frame reports `total_chunks`. Returns `None` if any chunk in
    /// `0..total_chunks` hasn't arrived yet.
    pub fn take_assembled(&self, request_id: &str, total_chunks: u32) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap();
        let chunks = guard.get(request_id)?;
        if (0..total_chunks).any(|i| !chunks.contains_key(&i)) {
            return None;
        }
        let chunks = guard.remove(request_id)?;
        let mut assembled = Vec::new();
        for i in 0..total_chunks {
            assembled.extend(chunks.get(&i)?);
        }
        Some(assembled)
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_once_all_chunks_present() {
        let buf = ReassemblyBuffers::new();
        buf.add_chunk("r1", 0, "aGVs");
        assert!(buf.take_assembled("r1", 2).is_none());
        buf.add_chunk("r1", 1, "bG8=");
        let assembled = buf.take_assembled("r1", 2).unwrap();
        assert_eq!(assembled, b"hello");
    }

    #[test]
    fn out_of_order_chunks_still_assemble_in_index_order() {
        let buf = ReassemblyBuffers::new();
        buf.add_chunk("r1", 2, "Yw==");
        buf.add_chunk("r1", 0, "YQ==");
        buf.add_chunk("r1", 1, "Yg==");
        let assembled = buf.take_assembled("r1", 3).unwrap();
        assert_eq!(assembled, b"abc");
    }
}
