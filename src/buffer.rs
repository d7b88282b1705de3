//! A flat, contiguous read/write buffer.
//!
//! This is the parser's staging area: socket reads land in the writable
//! region, the state machine consumes from the readable region. Both
//! cursors live in one allocation that compacts or grows on demand.

/// Default capacity of a fresh buffer, in bytes.
pub const DEFAULT_CAPACITY: usize = 4 * 1024;

/// A contiguous buffer with independent read and write cursors.
///
/// The readable region is `[read_pos, write_pos)`; the writable region is
/// `[write_pos, capacity)`. [`ensure_writable`](Buffer::ensure_writable)
/// first tries to reclaim consumed front space by compacting, and only
/// reallocates when compaction cannot satisfy the request.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(1)],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_size(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Whether the readable region is empty.
    pub fn readable_empty(&self) -> bool {
        self.write_pos == self.read_pos
    }

    /// Number of bytes that fit without compaction or growth.
    pub fn writable_size(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// The readable region.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// The writable region, for callers that fill the buffer directly
    /// (e.g. a socket read). Pair with [`advance_write`](Self::advance_write).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Moves the read cursor forward, clamped to the readable size.
    pub fn advance_read(&mut self, step: usize) {
        self.read_pos += step.min(self.readable_size());
        if self.read_pos == self.write_pos {
            // Nothing left unread; rewind both cursors for free space.
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Moves the write cursor forward, clamped to the writable size.
    pub fn advance_write(&mut self, step: usize) {
        self.write_pos += step.min(self.writable_size());
    }

    /// Copies up to `dst.len()` readable bytes out and consumes them.
    ///
    /// Returns the number of bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.readable_size());
        dst[..n].copy_from_slice(&self.data[self.read_pos..self.read_pos + n]);
        self.advance_read(n);
        n
    }

    /// Appends `src`, growing as needed.
    pub fn write(&mut self, src: &[u8]) {
        self.ensure_writable(src.len());
        self.data[self.write_pos..self.write_pos + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
    }

    /// Guarantees the writable region can hold at least `size` bytes.
    pub fn ensure_writable(&mut self, size: usize) {
        if self.writable_size() >= size {
            return;
        }
        let readable = self.readable_size();
        if self.read_pos + self.writable_size() >= size {
            // Consumed front space is enough; slide the unread bytes down.
            self.data.copy_within(self.read_pos..self.write_pos, 0);
        } else {
            let mut grown = vec![0; (readable + size).max(self.data.len()) * 2];
            grown[..readable].copy_from_slice(&self.data[self.read_pos..self.write_pos]);
            self.data = grown;
        }
        self.read_pos = 0;
        self.write_pos = readable;
    }

    /// Discards everything and rewinds both cursors.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests the basic write-then-read cycle and the size accessors.
    #[test]
    fn test_write_then_read() {
        let mut buf = Buffer::with_capacity(16);
        assert!(buf.readable_empty());
        buf.write(b"hello world");
        assert_eq!(buf.readable_size(), 11);
        assert_eq!(buf.readable(), b"hello world");

        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(buf.readable(), b" world");
    }

    /// Tests that compaction reclaims consumed front space without growth.
    #[test]
    fn test_compaction() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abcdef");
        let mut out = [0u8; 4];
        buf.read(&mut out);
        // 2 readable, 2 writable; a 4-byte write fits after compaction.
        buf.write(b"ghij");
        assert_eq!(buf.readable(), b"efghij");
    }

    /// Tests growth when compaction cannot satisfy the request.
    #[test]
    fn test_growth() {
        let mut buf = Buffer::with_capacity(4);
        buf.write(b"abcd");
        buf.write(b"efghijklmnop");
        assert_eq!(buf.readable(), b"abcdefghijklmnop");
    }

    /// Tests cursor rewind once all readable bytes are consumed.
    #[test]
    fn test_rewind_when_drained() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abc");
        buf.advance_read(3);
        assert!(buf.readable_empty());
        assert_eq!(buf.writable_size(), 8);
    }

    /// Tests direct fills through `spare_mut` + `advance_write`.
    #[test]
    fn test_spare_fill() {
        let mut buf = Buffer::with_capacity(8);
        buf.spare_mut()[..3].copy_from_slice(b"xyz");
        buf.advance_write(3);
        assert_eq!(buf.readable(), b"xyz");
    }
}
