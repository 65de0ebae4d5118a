// SPDX-License-Identifier: Apache-2.0

//! The rolling byte buffer shared by the RTSP audio path and the
//! WebSocket stream mode: bytes are appended and grouped into fixed-size
//! chunks, and the buffer is kept to a bounded tail once it overflows.
//!
//! Also home to [`DiscreteLatch`], the simpler "replace on push, emit once
//! per unique push" buffer used by the WebSocket discrete mode and by
//! RTSP video (which never accumulates — a new frame replaces the last).

/// Chunked, bounded-tail rolling buffer (`DataProcessorStream` in the
/// source material's terms).
///
/// `push` appends bytes to a pending area; once `chunk_bytes` worth have
/// accumulated, one chunk at a time is moved into the rolling buffer. After
/// each chunk lands, if the buffer exceeds `max_bytes` its head is trimmed
/// by `trim_bytes` repeatedly until it fits — this keeps the universal
/// invariant "buffer length is always in `[0, max_bytes]`" (§8) true even
/// when `trim_bytes` is small relative to a single chunk.
pub struct RollingBuffer {
    chunk_bytes: usize,
    max_bytes: usize,
    trim_bytes: usize,
    pending: Vec<u8>,
    buffer: Vec<u8>,
    has_new: bool,
}

impl RollingBuffer {
    pub fn new(chunk_bytes: usize, max_bytes: usize, trim_bytes: usize) -> Self {
        RollingBuffer {
            chunk_bytes: chunk_bytes.max(1),
            max_bytes,
            trim_bytes: trim_bytes.max(1),
            pending: Vec::new(),
            buffer: Vec::new(),
            has_new: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while self.pending.len() >= self.chunk_bytes {
            let chunk: Vec<u8> = self.pending.drain(..self.chunk_bytes).collect();
            self.buffer.extend_from_slice(&chunk);
            self.has_new = true;
            while self.buffer.len() > self.max_bytes && !self.buffer.is_empty() {
                let drop_n = self.trim_bytes.min(self.buffer.len());
                let _ = self.buffer.drain(..drop_n);
            }
        }
    }

    /// Returns a snapshot of the buffer iff new bytes have accrued since the
    /// last call, matching the "emit only when new chunks landed" contract.
    pub fn snapshot_if_new(&mut self) -> Option<Vec<u8>> {
        if self.has_new {
            self.has_new = false;
            Some(self.buffer.clone())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Replace-on-push latch: every push overwrites the last value and arms
/// `has_new`; a ticker drains it at most once per unique push.
#[derive(Default)]
pub struct DiscreteLatch {
    value: Vec<u8>,
    has_new: bool,
}

impl DiscreteLatch {
    pub fn push(&mut self, data: Vec<u8>) {
        self.value = data;
        self.has_new = true;
    }

    pub fn take_if_new(&mut self) -> Option<Vec<u8>> {
        if self.has_new {
            self.has_new = false;
            Some(self.value.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_buffer_groups_into_chunks() {
        let mut rb = RollingBuffer::new(4, 1000, 4);
        rb.push(b"ab");
        assert_eq!(rb.snapshot_if_new(), None, "less than one chunk buffered");
        rb.push(b"cd");
        assert_eq!(rb.snapshot_if_new().as_deref(), Some(&b"abcd"[..]));
        assert_eq!(rb.snapshot_if_new(), None, "no new bytes since last snapshot");
    }

    #[test]
    fn rolling_buffer_trims_head_past_max_bytes() {
        let mut rb = RollingBuffer::new(4, 8, 4);
        rb.push(&[1u8; 4]);
        rb.push(&[2u8; 4]);
        rb.push(&[3u8; 4]);
        assert!(rb.len() <= 8, "buffer must stay within max_bytes");
        assert_eq!(rb.len(), 8);
        let snap = rb.snapshot_if_new().unwrap();
        assert_eq!(&snap, &[2u8, 2, 2, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn discrete_latch_emits_once_per_push() {
        let mut latch = DiscreteLatch::default();
        assert_eq!(latch.take_if_new(), None);
        latch.push(b"a".to_vec());
        assert_eq!(latch.take_if_new(), Some(b"a".to_vec()));
        assert_eq!(latch.take_if_new(), None);
    }
}
