//! A segmented byte buffer for scatter/gather I/O.
//!
//! Responses are assembled here: serialized header bytes land in owned
//! segments, while large payloads (memory-mapped files, static literals)
//! join as foreign segments that the buffer never copies. The readable
//! region converts to an [`IoSlice`] vector, so one `writev` transmits
//! owned and foreign runs in order.
//!
//! Layout invariants:
//! - segments before the write cursor are fully written and readable,
//! - the cursor segment holds `write_off` written bytes and is owned,
//! - segments after the cursor are fresh owned segments awaiting writes,
//! - the read cursor always addresses the front segment.
//!
//! A fully consumed front segment is recycled to the tail when owned, or
//! dropped (running its release function) when foreign.

use std::collections::VecDeque;
use std::io::IoSlice;

/// Default capacity of each fresh owned segment, in bytes.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 4 * 1024;

/// Runs exactly once when a foreign segment is released.
pub type ReleaseFn = Box<dyn FnOnce(*mut u8, usize) + Send>;

/// One byte run inside a [`BufferVec`].
pub enum Segment {
    /// Buffer-owned storage. `start..start + len` is the usable window;
    /// recycling restores the window to the full allocation.
    Owned {
        data: Box<[u8]>,
        start: usize,
        len: usize,
    },
    /// Externally owned, read-only storage. `start..start + len` is the
    /// usable window inside the region; the release function is the
    /// segment's destructor, runs exactly once, and always receives the
    /// original pointer and capacity.
    Foreign {
        ptr: *mut u8,
        cap: usize,
        start: usize,
        len: usize,
        release: Option<ReleaseFn>,
    },
}

// A foreign segment may only be constructed through the unsafe
// `BufferVec::push_foreign`, whose contract requires the region to remain
// valid and transferable across threads until the release function runs.
unsafe impl Send for Segment {}

impl Segment {
    fn owned(capacity: usize) -> Self {
        Segment::Owned {
            data: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: capacity,
        }
    }

    /// The usable length of the segment.
    fn len(&self) -> usize {
        match self {
            Segment::Owned { len, .. } => *len,
            Segment::Foreign { len, .. } => *len,
        }
    }

    /// The usable window as a slice.
    fn as_slice(&self) -> &[u8] {
        match self {
            Segment::Owned { data, start, len } => &data[*start..*start + *len],
            Segment::Foreign {
                ptr, start, len, ..
            } => unsafe { std::slice::from_raw_parts(ptr.add(*start), *len) },
        }
    }

    /// The usable window, mutably. Foreign segments are read-only.
    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Segment::Owned { data, start, len } => Some(&mut data[*start..*start + *len]),
            Segment::Foreign { .. } => None,
        }
    }

    /// Shrinks the usable window to `new_len` bytes. Owned only.
    fn truncate(&mut self, new_len: usize) {
        if let Segment::Owned { len, .. } = self {
            debug_assert!(new_len <= *len);
            *len = new_len;
        }
    }

    /// Moves the window start forward by `n`, shrinking the length.
    fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        match self {
            Segment::Owned { start, len, .. } | Segment::Foreign { start, len, .. } => {
                *start += n;
                *len -= n;
            }
        }
    }

    /// Restores an owned segment to its full allocation for reuse.
    ///
    /// Returns `false` for foreign segments, which cannot be rewritten.
    fn recycle(&mut self) -> bool {
        match self {
            Segment::Owned { data, start, len } => {
                *start = 0;
                *len = data.len();
                true
            }
            Segment::Foreign { .. } => false,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Segment::Foreign {
            ptr, cap, release, ..
        } = self
        {
            if let Some(release) = release.take() {
                release(*ptr, *cap);
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Owned { data, start, len } => f
                .debug_struct("Owned")
                .field("cap", &data.len())
                .field("start", start)
                .field("len", len)
                .finish(),
            Segment::Foreign { len, .. } => {
                f.debug_struct("Foreign").field("len", len).finish()
            }
        }
    }
}

/// An ordered sequence of segments with one write cursor and one read
/// cursor.
#[derive(Debug)]
pub struct BufferVec {
    segments: VecDeque<Segment>,
    /// Capacity of each fresh owned segment.
    seg_cap: usize,
    /// Bytes already consumed from the front segment.
    read_off: usize,
    /// Index of the segment the write cursor is in.
    write_idx: usize,
    /// Bytes already written into the cursor segment.
    write_off: usize,
}

impl Default for BufferVec {
    fn default() -> Self {
        Self::with_segment_capacity(DEFAULT_SEGMENT_CAPACITY)
    }
}

impl BufferVec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer whose fresh owned segments hold `capacity` bytes.
    pub fn with_segment_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut segments = VecDeque::new();
        segments.push_back(Segment::owned(capacity));
        Self {
            segments,
            seg_cap: capacity,
            read_off: 0,
            write_idx: 0,
            write_off: 0,
        }
    }

    /// Bytes between the read cursor and the write cursor.
    pub fn readable_size(&self) -> usize {
        let before: usize = self
            .segments
            .iter()
            .take(self.write_idx)
            .map(Segment::len)
            .sum();
        before + self.write_off - self.read_off
    }

    /// Whether there is nothing left to read.
    pub fn readable_empty(&self) -> bool {
        self.write_idx == 0 && self.write_off == self.read_off
    }

    /// Bytes between the write cursor and the end of the last segment.
    pub fn writable_size(&self) -> usize {
        let tail: usize = self
            .segments
            .iter()
            .skip(self.write_idx + 1)
            .map(Segment::len)
            .sum();
        self.segments[self.write_idx].len() - self.write_off + tail
    }

    /// Guarantees `writable_size() > size` by appending fresh segments.
    pub fn ensure_writable(&mut self, size: usize) {
        let remain = self.writable_size();
        if remain > size {
            return;
        }
        let missing = (size - remain) / self.seg_cap + 1;
        for _ in 0..missing {
            self.segments.push_back(Segment::owned(self.seg_cap));
        }
    }

    /// Appends bytes at the write cursor, copying into owned segments.
    pub fn write(&mut self, mut src: &[u8]) {
        self.ensure_writable(src.len());
        while !src.is_empty() {
            let seg = &mut self.segments[self.write_idx];
            let dst = seg
                .as_mut_slice()
                .expect("write cursor sits on an owned segment");
            let n = src.len().min(dst.len() - self.write_off);
            dst[self.write_off..self.write_off + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            self.write_off += n;
            if self.write_off == self.segments[self.write_idx].len() {
                self.forward_writer();
            }
        }
    }

    /// Appends a string slice.
    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    /// Splices the readable segments of `other` into this buffer at the
    /// write cursor, donating ownership instead of copying. Foreign
    /// read-only segments are moved as-is. `other` is left empty and
    /// reusable.
    pub fn append(&mut self, other: &mut BufferVec) {
        if other.readable_empty() {
            return;
        }
        self.seal_write_segment();

        // Freeze other's cursor segment at its written length, then trim
        // the consumed prefix off its front segment.
        let take = if other.write_off != 0 {
            other.segments[other.write_idx].truncate(other.write_off);
            other.write_idx + 1
        } else {
            other.write_idx
        };
        if other.read_off != 0 {
            other.segments[0].advance(other.read_off);
        }

        for seg in other.segments.drain(..take) {
            self.segments.insert(self.write_idx, seg);
            self.write_idx += 1;
        }

        other.read_off = 0;
        other.write_idx = 0;
        other.write_off = 0;
        if other.segments.is_empty() {
            other.segments.push_back(Segment::owned(other.seg_cap));
        }
    }

    /// Inserts an externally owned, read-only region at the write cursor
    /// without copying, sealing any partially written owned segment first.
    /// `release` runs exactly once when the segment is dropped.
    ///
    /// # Safety
    /// `ptr..ptr + len` must stay valid and untouched by others until
    /// `release` runs, and must be safe to access from any thread the
    /// buffer travels to.
    pub unsafe fn push_foreign(&mut self, ptr: *mut u8, len: usize, release: ReleaseFn) {
        self.seal_write_segment();
        self.segments.insert(
            self.write_idx,
            Segment::Foreign {
                ptr,
                cap: len,
                start: 0,
                len,
                release: Some(release),
            },
        );
        self.write_idx += 1;
        debug_assert!(self.write_idx < self.segments.len());
    }

    /// Inserts a `'static` region (e.g. a string literal) at the write
    /// cursor without copying.
    pub fn write_static(&mut self, bytes: &'static [u8]) {
        if bytes.is_empty() {
            return;
        }
        // Safety: 'static data outlives everything and needs no release.
        unsafe { self.push_foreign(bytes.as_ptr() as *mut u8, bytes.len(), Box::new(|_, _| {})) }
    }

    /// Copies up to `dst.len()` readable bytes out and consumes them.
    ///
    /// Returns the number of bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let total = dst.len().min(self.readable_size());
        let mut copied = 0;
        while copied < total {
            let limit = self.front_readable_len();
            let n = (total - copied).min(limit - self.read_off);
            let src = &self.segments[0].as_slice()[self.read_off..self.read_off + n];
            dst[copied..copied + n].copy_from_slice(src);
            copied += n;
            self.read_off += n;
            if self.write_idx > 0 && self.read_off == self.segments[0].len() {
                self.forward_reader();
            }
        }
        copied
    }

    /// Moves the read cursor forward by `step` bytes, recycling owned
    /// front segments and dropping foreign ones as they are consumed.
    /// A step past the readable size clears the buffer.
    pub fn advance_read(&mut self, step: usize) {
        if step >= self.readable_size() {
            self.clear();
            return;
        }
        let mut remaining = step;
        while remaining > 0 {
            let limit = self.front_readable_len();
            let n = remaining.min(limit - self.read_off);
            remaining -= n;
            self.read_off += n;
            if self.write_idx > 0 && self.read_off == self.segments[0].len() {
                self.forward_reader();
            }
        }
    }

    /// The readable region as an ordered gather list for `writev`.
    pub fn read_view(&self) -> Vec<IoSlice<'_>> {
        if self.readable_empty() {
            return Vec::new();
        }
        if self.write_idx == 0 {
            let front = &self.segments[0].as_slice()[self.read_off..self.write_off];
            return vec![IoSlice::new(front)];
        }
        let mut views = Vec::with_capacity(self.write_idx + 1);
        views.push(IoSlice::new(&self.segments[0].as_slice()[self.read_off..]));
        for seg in self.segments.iter().take(self.write_idx).skip(1) {
            views.push(IoSlice::new(seg.as_slice()));
        }
        if self.write_off != 0 {
            views.push(IoSlice::new(
                &self.segments[self.write_idx].as_slice()[..self.write_off],
            ));
        }
        views
    }

    /// The writable region as an ordered list of mutable runs, for
    /// scatter reads.
    pub fn write_view(&mut self) -> Vec<&mut [u8]> {
        let write_idx = self.write_idx;
        let write_off = self.write_off;
        let mut views = Vec::new();
        for (i, seg) in self.segments.iter_mut().enumerate().skip(write_idx) {
            let slice = seg
                .as_mut_slice()
                .expect("segments at or after the write cursor are owned");
            let off = if i == write_idx { write_off } else { 0 };
            if off < slice.len() {
                views.push(&mut slice[off..]);
            }
        }
        views
    }

    /// Drops all foreign segments, restores owned segments to their full
    /// capacity, and rewinds both cursors.
    pub fn clear(&mut self) {
        self.segments.retain_mut(Segment::recycle);
        if self.segments.is_empty() {
            self.segments.push_back(Segment::owned(self.seg_cap));
        }
        self.read_off = 0;
        self.write_idx = 0;
        self.write_off = 0;
    }

    /// Number of segments currently held. Exposed for tests and tuning.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The readable extent of the front segment: its full length when the
    /// write cursor is past it, else the written prefix.
    fn front_readable_len(&self) -> usize {
        if self.write_idx == 0 {
            self.write_off
        } else {
            self.segments[0].len()
        }
    }

    /// Freezes the cursor segment at its written length and moves the
    /// cursor to the next segment. No-op when nothing has been written
    /// into the cursor segment.
    fn seal_write_segment(&mut self) {
        if self.write_off == 0 {
            return;
        }
        self.segments[self.write_idx].truncate(self.write_off);
        self.write_idx += 1;
        self.write_off = 0;
        if self.write_idx == self.segments.len() {
            self.segments.push_back(Segment::owned(self.seg_cap));
        }
    }

    /// Advances the write cursor past an exactly full segment.
    fn forward_writer(&mut self) {
        self.write_idx += 1;
        self.write_off = 0;
        if self.write_idx == self.segments.len() {
            self.segments.push_back(Segment::owned(self.seg_cap));
        }
    }

    /// Retires the fully consumed front segment: owned segments are
    /// recycled to the tail, foreign segments are dropped.
    fn forward_reader(&mut self) {
        let mut seg = self.segments.pop_front().expect("front segment exists");
        if seg.recycle() {
            self.segments.push_back(seg);
        }
        self.read_off = 0;
        self.write_idx -= 1;
    }
}
