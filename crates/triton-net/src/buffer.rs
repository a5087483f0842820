//! The session send buffer.

use std::collections::VecDeque;

use bytes::Bytes;

/// A splice-friendly byte sequence: a deque of [`Bytes`] chunks.
///
/// `splice` moves whole chunk lists in O(1), so `send()` callers never copy
/// under the buffer mutex. Only the pump consumes: it `peek`s a prefix into a
/// scratch slice, performs the write syscall with the mutex released, then
/// `discard`s the written prefix, which is stable because producers only
/// append.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer holding a copy of `data` as one chunk.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.put(data);
        buffer
    }

    /// Total buffered bytes across all chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a copy of `data`.
    pub fn put(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.put_bytes(Bytes::copy_from_slice(data));
        }
    }

    /// Appends a chunk without copying.
    pub fn put_bytes(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Moves every chunk of `other` onto the end of `self` in O(1) amortized,
    /// leaving `other` empty.
    pub fn splice(&mut self, other: &mut StreamBuffer) {
        self.len += other.len;
        other.len = 0;
        self.chunks.append(&mut other.chunks);
    }

    /// Copies the buffer's prefix into `out` without consuming it. Returns
    /// the number of bytes copied.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == out.len() {
                break;
            }
            let take = chunk.len().min(out.len() - copied);
            out[copied..copied + take].copy_from_slice(&chunk[..take]);
            copied += take;
        }
        copied
    }

    /// Drops up to `count` bytes from the front. Returns the number dropped.
    pub fn discard(&mut self, count: usize) -> usize {
        let mut remaining = count.min(self.len);
        let dropped = remaining;
        while remaining > 0 {
            let chunk = self
                .chunks
                .front_mut()
                .expect("buffer length out of sync with chunks");
            if chunk.len() <= remaining {
                remaining -= chunk.len();
                self.len -= chunk.len();
                self.chunks.pop_front();
            } else {
                let _ = chunk.split_to(remaining);
                self.len -= remaining;
                remaining = 0;
            }
        }
        dropped
    }
}
