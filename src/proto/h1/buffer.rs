//! Growable header-buffer pool.
//!
//! The first buffer is the per-connection input buffer, lazily allocated at
//! `client_header_buffer_size` and released again while the connection is
//! idle. When the request head outgrows it, bounded "large" buffers take
//! over one at a time; an unterminated token is copied to the front of the
//! next buffer and every outstanding parser mark is fixed up.

use bytes::BytesMut;
use tracing::trace;

/// A half-open range of bytes inside one pool buffer.
///
/// Completed tokens hold the id of the buffer they were parsed from; those
/// buffers stay pinned until the request is freed, so a `Span` never
/// dangles across a grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Span {
    pub buf: u16,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub(crate) fn new(buf: u16, start: u32, end: u32) -> Span {
        debug_assert!(start <= end);
        Span { buf, start, end }
    }

    pub(crate) fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Outcome of asking the pool for more room.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Grow {
    /// A fresh buffer is active; marks were relocated by the given offset.
    Moved,
    /// The pool is exhausted; the caller maps this to 414 or 431.
    Exhausted,
}

pub(crate) struct HeaderBuffers {
    bufs: Vec<Option<BytesMut>>,
    free: Vec<usize>,
    header_size: usize,
    large_num: usize,
    large_size: usize,
    large_busy: usize,
    active: usize,
    /// Parse cursor within the active buffer.
    pub pos: usize,
}

impl HeaderBuffers {
    pub(crate) fn new(header_size: usize, large_num: usize, large_size: usize) -> HeaderBuffers {
        HeaderBuffers {
            bufs: vec![None],
            free: Vec::new(),
            header_size,
            large_num,
            large_size,
            large_busy: 0,
            active: 0,
            pos: 0,
        }
    }

    pub(crate) fn active_id(&self) -> u16 {
        self.active as u16
    }

    /// Lazily allocates the connection input buffer.
    pub(crate) fn ensure_input(&mut self) {
        if self.bufs[0].is_none() {
            self.bufs[0] = Some(BytesMut::with_capacity(self.header_size));
        }
    }

    /// Releases the input buffer while idle, but only when no bytes are
    /// pending in it.
    pub(crate) fn release_input_if_empty(&mut self) {
        if self.active == 0 && self.unparsed().is_empty() {
            self.bufs[0] = None;
            self.pos = 0;
        }
    }

    pub(crate) fn active_buf(&self) -> &[u8] {
        self.bufs[self.active]
            .as_ref()
            .map(|b| &b[..])
            .unwrap_or(&[])
    }

    /// Bytes read from the wire but not yet consumed by the parser.
    pub(crate) fn unparsed(&self) -> &[u8] {
        &self.active_buf()[self.pos.min(self.active_len())..]
    }

    pub(crate) fn active_len(&self) -> usize {
        self.bufs[self.active].as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub(crate) fn active_buf_mut(&mut self) -> &mut BytesMut {
        self.bufs[self.active]
            .as_mut()
            .expect("active buffer allocated")
    }

    pub(crate) fn active_spare(&self) -> usize {
        let cap = if self.active == 0 {
            self.header_size
        } else {
            self.large_size
        };
        cap.saturating_sub(self.active_len())
    }

    /// Appends wire bytes into the active buffer. The caller must check
    /// `active_spare` first; this never grows past the fixed capacity.
    pub(crate) fn fill(&mut self, data: &[u8]) -> usize {
        let spare = self.active_spare();
        let n = data.len().min(spare);
        self.ensure_input();
        self.bufs[self.active]
            .as_mut()
            .expect("active buffer allocated")
            .extend_from_slice(&data[..n]);
        n
    }

    pub(crate) fn slice(&self, span: Span) -> &[u8] {
        match self.bufs[span.buf as usize] {
            Some(ref b) => &b[span.start as usize..span.end as usize],
            None => &[],
        }
    }

    /// Switches parsing to a large buffer, carrying the unterminated token
    /// that starts at `token_start` along. Returns the relocation delta the
    /// parser applies to its marks, or `Exhausted`.
    ///
    /// A token that already fills a whole large buffer can never terminate,
    /// so it is reported as exhaustion as well.
    pub(crate) fn grow(&mut self, token_start: Option<usize>) -> Grow {
        let tail_start = match token_start {
            Some(s) => s,
            // Nothing in flight (the buffer was filled by leading CRLFs):
            // just reset the active buffer in place.
            None => {
                let pos = self.pos;
                if let Some(b) = self.bufs[self.active].as_mut() {
                    let _ = b.split_to(pos);
                }
                self.pos = 0;
                return Grow::Moved;
            }
        };

        let tail_len = self.active_len() - tail_start;
        if tail_len >= self.large_size {
            return Grow::Exhausted;
        }

        let id = if let Some(id) = self.free.pop() {
            debug_assert!(self.bufs[id].is_none());
            self.bufs[id] = Some(BytesMut::with_capacity(self.large_size));
            id
        } else if self.large_busy < self.large_num {
            self.bufs.push(Some(BytesMut::with_capacity(self.large_size)));
            self.bufs.len() - 1
        } else {
            return Grow::Exhausted;
        };
        self.large_busy += 1;

        trace!(
            "large header copy: {} bytes from buf {} to buf {}",
            tail_len,
            self.active,
            id
        );

        let tail = {
            let src = self.bufs[self.active].as_ref().expect("active allocated");
            src[tail_start..].to_vec()
        };
        // The copied tail no longer belongs to the old buffer; truncate so
        // spans recorded against it stay unambiguous.
        self.bufs[self.active]
            .as_mut()
            .expect("active allocated")
            .truncate(tail_start);

        let dst = self.bufs[id].as_mut().expect("fresh buffer");
        dst.extend_from_slice(&tail);

        self.pos -= tail_start;
        self.active = id;
        Grow::Moved
    }

    /// Prepares the pool for the next request on the same connection.
    ///
    /// Large buffers other than the one holding pipelined leftovers go back
    /// to the free list; with no leftovers everything is released.
    pub(crate) fn recycle(&mut self, keep_leftover: bool) {
        for id in 1..self.bufs.len() {
            if keep_leftover && id == self.active {
                continue;
            }
            if self.bufs[id].take().is_some() {
                self.large_busy -= 1;
                self.free.push(id);
            }
        }
        if !keep_leftover {
            self.active = 0;
            self.pos = 0;
            if let Some(b) = self.bufs[0].as_mut() {
                b.clear();
            }
        }
    }

}
