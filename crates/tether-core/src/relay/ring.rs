//! Fixed-capacity byte ring with absolute offsets
//!
//! Every byte ever written has an absolute offset; the ring keeps the newest
//! `capacity` of them. Readers track offsets rather than indexes so they can
//! tell exactly what they already sent and what was overwritten.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::tail::plain_lines;

pub type SharedRing = Arc<Mutex<ByteRing>>;

#[derive(Debug)]
pub struct ByteRing {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Absolute offset one past the newest byte
    head: u64,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub fn shared(capacity: usize) -> SharedRing {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Append `data`; returns the absolute offset of its first byte
    pub fn push(&mut self, data: &[u8]) -> u64 {
        let offset = self.head;
        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
        } else {
            let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
            self.buf.drain(..overflow);
            self.buf.extend(data);
        }
        self.head += data.len() as u64;
        offset
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Oldest offset still held
    pub fn start(&self) -> u64 {
        self.head - self.buf.len() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes from `offset` to the head. Returns the offset actually served,
    /// which is later than requested if the region was overwritten.
    pub fn read_from(&self, offset: u64) -> (u64, Vec<u8>) {
        let start = offset.max(self.start());
        if start >= self.head {
            return (self.head, Vec::new());
        }
        let skip = (start - self.start()) as usize;
        (start, self.buf.iter().skip(skip).copied().collect())
    }

    /// Newest `max_bytes` bytes
    pub fn recent(&self, max_bytes: usize) -> (u64, Vec<u8>) {
        self.read_from(self.head.saturating_sub(max_bytes as u64))
    }

    /// Newest `lines` lines as plain text
    pub fn tail_text(&self, lines: usize) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        let text = String::from_utf8_lossy(&bytes);
        plain_lines(&text, lines).join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_survive_wraparound() {
        let mut ring = ByteRing::new(8);
        assert_eq!(ring.push(b"abcde"), 0);
        assert_eq!(ring.push(b"fghij"), 5);
        assert_eq!(ring.head(), 10);
        assert_eq!(ring.start(), 2);
        assert_eq!(ring.read_from(4), (4, b"efghij".to_vec()));
        // overwritten region is skipped, not invented
        assert_eq!(ring.read_from(0), (2, b"cdefghij".to_vec()));
        assert_eq!(ring.read_from(10), (10, Vec::new()));
    }

    #[test]
    fn test_oversized_push_keeps_newest() {
        let mut ring = ByteRing::new(4);
        ring.push(b"xy");
        assert_eq!(ring.push(b"0123456789"), 2);
        assert_eq!(ring.head(), 12);
        assert_eq!(ring.read_from(0), (8, b"6789".to_vec()));
        assert_eq!(ring.recent(2), (10, b"89".to_vec()));
    }

    #[test]
    fn test_tail_text_strips_escapes() {
        let mut ring = ByteRing::new(1024);
        ring.push(b"one\r\n\x1b[32mtwo\x1b[0m\r\nthree\n");
        assert_eq!(ring.tail_text(2), "two\nthree");
    }
}
