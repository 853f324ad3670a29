//! Growable byte buffer backing each connection's input and output queues.
//!
//! Layout mirrors the classic network-buffer split:
//!
//! ```text
//! +------------------+------------------+------------------+
//! |  reserved bytes  |  readable bytes  |  writable bytes  |
//! +------------------+------------------+------------------+
//! 0      <=      read_pos      <=    write_pos    <=     len
//! ```
//!
//! The reserved leading region lets a protocol layer prepend a small header
//! without shifting the payload. A `Buffer` is single-threaded by contract:
//! callers (the owning connection) provide exclusion.

use std::io;
use std::io::{IoSliceMut, Read};

/// Bytes kept free at the front for cheap prepends.
pub const RESERVED_PREFIX: usize = 8;

/// Initial writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack-local fallback region used by [`Buffer::read_from`].
const FALLBACK_SIZE: usize = 64 * 1024;

pub struct Buffer {
    store: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            store: vec![0; RESERVED_PREFIX + initial],
            read_pos: RESERVED_PREFIX,
            write_pos: RESERVED_PREFIX,
        }
    }

    /// Number of unread bytes.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Free space after the write cursor.
    pub fn writable_bytes(&self) -> usize {
        self.store.len() - self.write_pos
    }

    /// Space in front of the read cursor (reserved prefix plus consumed bytes).
    pub fn reserved_bytes(&self) -> usize {
        self.read_pos
    }

    /// The unread region, without copying.
    pub fn peek(&self) -> &[u8] {
        &self.store[self.read_pos..self.write_pos]
    }

    /// Advances the read cursor by `n`. Consuming everything resets both
    /// cursors to the reserved offset so the space is reused without
    /// reallocation.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_pos += n;
        } else {
            self.consume_all();
        }
    }

    pub fn consume_all(&mut self) {
        self.read_pos = RESERVED_PREFIX;
        self.write_pos = RESERVED_PREFIX;
    }

    /// Takes `len` unread bytes out as a `String` (lossy on invalid UTF-8).
    pub fn consume_as_string(&mut self, len: usize) -> String {
        debug_assert!(len <= self.readable_bytes());
        let result = String::from_utf8_lossy(&self.store[self.read_pos..self.read_pos + len])
            .into_owned();
        self.consume(len);
        result
    }

    /// Copies `data` into the writable region, growing or compacting first.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.store[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Growth policy: if trailing free space plus the reclaimable leading
    /// space cannot hold `len`, reallocate to exactly fit; otherwise slide
    /// the unread bytes back to the reserved offset.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.reserved_bytes() < len + RESERVED_PREFIX {
            self.store.resize(self.write_pos + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.store
                .copy_within(self.read_pos..self.write_pos, RESERVED_PREFIX);
            self.read_pos = RESERVED_PREFIX;
            self.write_pos = self.read_pos + readable;
        }
    }

    /// One scatter-read from `io` into the writable tail plus a bounded
    /// stack-local fallback region, so a single call can absorb more than
    /// the buffer currently has room for. Overflow is appended (after
    /// growth) from the fallback.
    pub fn read_from<R: Read>(&mut self, io: &mut R) -> io::Result<usize> {
        let mut fallback = [0u8; FALLBACK_SIZE];
        let writable = self.writable_bytes();

        let n = if writable < FALLBACK_SIZE {
            let (_, tail) = self.store.split_at_mut(self.write_pos);
            let mut bufs = [IoSliceMut::new(tail), IoSliceMut::new(&mut fallback)];
            io.read_vectored(&mut bufs)?
        } else {
            io.read(&mut self.store[self.write_pos..])?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.store.len();
            self.append(&fallback[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out a fixed byte pattern, filling every provided
    /// slice in order so the vectored overflow path is exercised.
    struct PatternReader {
        remaining: usize,
    }

    impl Read for PatternReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.remaining);
            for b in &mut buf[..n] {
                *b = 0xAB;
            }
            self.remaining -= n;
            Ok(n)
        }

        fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
            let mut total = 0;
            for buf in bufs {
                let n = buf.len().min(self.remaining);
                for b in &mut buf[..n] {
                    *b = 0xAB;
                }
                self.remaining -= n;
                total += n;
                if self.remaining == 0 {
                    break;
                }
            }
            Ok(total)
        }
    }

    fn assert_invariants(buf: &Buffer) {
        assert!(buf.read_pos <= buf.write_pos);
        assert!(buf.write_pos <= buf.store.len());
    }

    #[test]
    fn fresh_buffer_cursors() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.reserved_bytes(), RESERVED_PREFIX);
        assert_invariants(&buf);
    }

    #[test]
    fn append_consume_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello reactor");
        assert_eq!(buf.readable_bytes(), 13);
        assert_eq!(buf.peek(), b"hello reactor");
        assert_eq!(buf.consume_as_string(13), "hello reactor");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.reserved_bytes(), RESERVED_PREFIX);
        assert_invariants(&buf);
    }

    #[test]
    fn empty_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"");
        assert_eq!(buf.consume_as_string(0), "");
        assert_invariants(&buf);
    }

    #[test]
    fn round_trip_exceeding_initial_capacity() {
        let mut buf = Buffer::new();
        let payload = "x".repeat(INITIAL_SIZE * 3);
        buf.append(payload.as_bytes());
        assert_eq!(buf.readable_bytes(), payload.len());
        assert_eq!(buf.consume_as_string(payload.len()), payload);
        assert_invariants(&buf);
    }

    #[test]
    fn consume_all_resets_to_reserved_offset() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.consume(3);
        assert_eq!(buf.peek(), b"def");
        buf.consume(buf.readable_bytes());
        assert_eq!(buf.read_pos, RESERVED_PREFIX);
        assert_eq!(buf.write_pos, RESERVED_PREFIX);
    }

    #[test]
    fn growth_compacts_in_place_when_leading_space_suffices() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; INITIAL_SIZE]);
        buf.consume(900);
        let len_before = buf.store.len();
        // 124 readable left; 900 reclaimable in front, so no reallocation.
        buf.append(&vec![2u8; 800]);
        assert_eq!(buf.store.len(), len_before);
        assert_eq!(buf.read_pos, RESERVED_PREFIX);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE - 900 + 800);
        assert_invariants(&buf);
    }

    #[test]
    fn growth_reallocates_exactly_to_fit() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; INITIAL_SIZE]);
        buf.append(&vec![2u8; 500]);
        // write_pos was RESERVED + INITIAL_SIZE; resized to write_pos + 500.
        assert_eq!(buf.store.len(), RESERVED_PREFIX + INITIAL_SIZE + 500);
        assert_eq!(buf.writable_bytes(), 0);
        assert_invariants(&buf);
    }

    #[test]
    fn read_from_fits_in_tail() {
        let mut buf = Buffer::new();
        let mut reader = PatternReader { remaining: 100 };
        let n = buf.read_from(&mut reader).unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf.readable_bytes(), 100);
        assert!(buf.peek().iter().all(|&b| b == 0xAB));
        assert_invariants(&buf);
    }

    #[test]
    fn read_from_overflows_into_fallback() {
        let mut buf = Buffer::new();
        let want = INITIAL_SIZE + 4096;
        let mut reader = PatternReader { remaining: want };
        let n = buf.read_from(&mut reader).unwrap();
        assert_eq!(n, want);
        assert_eq!(buf.readable_bytes(), want);
        assert!(buf.peek().iter().all(|&b| b == 0xAB));
        assert_invariants(&buf);
    }
}
