//! Opaque per-connection byte buffer: an owned byte region with a
//! position/limit/capacity cursor.
//!
//! DNS message parsing is out of scope for this crate; comm points only need
//! to know where the next read/write should land and how many bytes are
//! logically present. The cursor discipline mirrors a Java-NIO-style
//! `ByteBuffer` (`position`, `limit`, `capacity`, `flip`), which is exactly
//! what a length-prefixed read needs: once a full message has arrived,
//! `limit` equals the prefix value and `position` marks how much of it a
//! caller has consumed so far.

/// A fixed-capacity byte buffer with a read/write cursor (`position`) and a
/// logical end (`limit`).
///
/// Invariant: `position <= limit <= capacity` always holds.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl Buffer {
    /// Creates a buffer with the given capacity, ready for writing
    /// (`position == 0`, `limit == capacity`).
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0u8; capacity],
            position: 0,
            limit: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Sets the limit. Panics if `limit` exceeds `capacity` — a caller
    /// setting an out-of-range limit is always a core bug, never a runtime
    /// condition.
    pub fn set_limit(&mut self, limit: usize) {
        assert!(limit <= self.data.len(), "limit exceeds buffer capacity");
        self.limit = limit;
        if self.position > self.limit {
            self.position = self.limit;
        }
    }

    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.limit, "position exceeds limit");
        self.position = position;
    }

    /// Resets to an empty, write-ready buffer: `position = 0`, `limit = capacity`.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Switches from "just filled [0, position)" to "ready to drain
    /// [0, position)": sets `limit = position`, `position = 0`.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// The writable region `[position, capacity)`, for `recv`/`read` calls.
    pub fn writable_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.position..]
    }

    /// The readable region `[position, limit)`, for `send`/`write` calls.
    pub fn readable_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// The whole backing region up to `limit`, ignoring `position` — used to
    /// hand a complete message to a callback.
    pub fn contents(&self) -> &[u8] {
        &self.data[..self.limit]
    }

    /// Mutable access to the whole backing region up to `limit`.
    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.limit]
    }

    /// Advances `position` by `n` bytes, as if `n` bytes had just been
    /// read into/written from `writable_slice`/`readable_slice`.
    pub fn advance(&mut self, n: usize) {
        self.position += n;
        debug_assert!(self.position <= self.limit);
    }

    /// Overwrites the buffer with `bytes`, leaving it flipped and ready to
    /// drain (`position = 0`, `limit = bytes.len()`). Used by a callback
    /// that turns an inbound message into a reply in place, then asks the
    /// comm point to send whatever the buffer now holds.
    ///
    /// Panics if `bytes` doesn't fit in the buffer's capacity.
    pub fn fill(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.data.len(), "reply exceeds buffer capacity");
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.position = 0;
        self.limit = bytes.len();
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;

    #[test]
    fn write_then_flip_then_read() {
        let mut buf = Buffer::with_capacity(16);
        assert_eq!(buf.remaining(), 16);
        buf.writable_slice()[..5].copy_from_slice(b"hello");
        buf.advance(5);
        buf.flip();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 5);
        assert_eq!(buf.readable_slice(), b"hello");
    }

    #[test]
    fn set_limit_clamps_position() {
        let mut buf = Buffer::with_capacity(16);
        buf.set_position(10);
        buf.set_limit(4);
        assert_eq!(buf.position(), 4);
        assert_eq!(buf.limit(), 4);
    }

    #[test]
    #[should_panic(expected = "limit exceeds buffer capacity")]
    fn set_limit_beyond_capacity_panics() {
        let mut buf = Buffer::with_capacity(4);
        buf.set_limit(5);
    }
}
