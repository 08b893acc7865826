//! The request object and its arena.
//!
//! Requests live in a slab owned by the connection; handles are
//! generation-checked indices, so a parent holding its children's ids (and
//! children their parent's) can never observe a recycled slot.

use std::collections::VecDeque;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use slab::Slab;

use crate::phase::PhaseResult;
use crate::vhost::ServerBlock;
use std::sync::Arc;

use super::decode::Decoder;
use super::encode::Encoder;
use super::headers::HeadersIn;
use super::uri::RequestUri;

/// Stable, generation-checked handle to a request in the connection's
/// request set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId {
    idx: u32,
    gen: u32,
}

impl ReqId {
    pub(crate) fn index(&self) -> usize {
        self.idx as usize
    }
}

/// An ordered run of output frames, with the end-of-response marker.
pub(crate) struct Chain {
    pub data: Vec<Bytes>,
    pub last: bool,
}

/// Entry in a request's postponed list: either a queued child or a chunk
/// of output waiting for the write baton.
pub(crate) enum Postponed {
    Sub(ReqId),
    Data(Chain),
}

/// Continuation installed as a request's write handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    /// Entering (or re-entering) the phase pipeline.
    Phases,
    /// Flushing buffered output through the write driver.
    Writer,
    /// Done but still queued behind siblings; self-draining no-op that
    /// finalizes once the baton arrives.
    Finalizer,
    /// Forceful teardown was deferred behind `blocked`; runs as soon as
    /// the last blocking actor releases.
    Terminate,
    /// Nothing to do on write readiness.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadState {
    /// Parsing the head; the connection drives this directly.
    Head,
    /// A handler is consuming the body; new bytes re-enter the pipeline.
    Body,
    /// Draining an unread body so the connection can be reused.
    DiscardBody,
    /// No reader installed; read readiness only probes for early close.
    Test,
}

/// Callback run when a subrequest finalizes, before its parent wakes.
pub type PostSubrequest = Box<dyn FnMut(ReqId, PhaseResult) -> PhaseResult + Send>;

/// Outgoing response head built up by handlers.
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub(crate) sent: bool,
}

impl ResponseHead {
    fn new() -> ResponseHead {
        ResponseHead {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            content_length: None,
            sent: false,
        }
    }
}

pub struct Request {
    pub(crate) id: ReqId,
    pub(crate) parent: Option<ReqId>,
    pub(crate) main: ReqId,

    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) uri: RequestUri,
    pub(crate) headers_in: HeadersIn,
    pub(crate) headers_out: ResponseHead,

    // liveness counters; meaningful on the root only
    pub(crate) count: u32,
    pub(crate) blocked: u32,
    #[cfg(debug_assertions)]
    pub(crate) stakeholders: Vec<&'static str>,

    /// Remaining spawn depth for subrequests.
    pub(crate) subrequests: usize,

    pub(crate) write_state: WriteState,
    pub(crate) read_state: ReadState,
    pub(crate) postponed: VecDeque<Postponed>,
    /// Posted-requests FIFO; used on the root only.
    pub(crate) posted: VecDeque<ReqId>,
    pub(crate) post_subrequest: Option<PostSubrequest>,
    pub(crate) cleanup: Vec<Box<dyn FnOnce() + Send>>,

    pub(crate) discard_body: bool,
    pub(crate) keepalive: bool,
    pub(crate) lingering_close: bool,
    pub(crate) header_only: bool,
    pub(crate) done: bool,
    pub(crate) logged: bool,
    pub(crate) pipelined: bool,
    pub(crate) post_action: bool,
    pub(crate) request_complete: bool,
    pub(crate) reading_body: bool,
    pub(crate) buffered: bool,
    /// A queued 100 Continue is owed before the body is read.
    pub(crate) expect_continue: bool,

    /// Remaining request-body framing, for reads and discards.
    pub(crate) body: Option<Decoder>,
    /// Response body framing; picked when the head is serialized. Only the
    /// main request ever owns one.
    pub(crate) encoder: Option<Encoder>,

    pub(crate) server: Arc<ServerBlock>,
    /// Per-module context slots.
    pub(crate) extensions: http::Extensions,

    pub(crate) start_time: Instant,
    pub(crate) start_at: SystemTime,
}

impl Request {
    pub(crate) fn new(id: ReqId, server: Arc<ServerBlock>, subrequests: usize) -> Request {
        Request {
            id,
            parent: None,
            main: id,
            method: Method::GET,
            version: Version::HTTP_11,
            uri: RequestUri::default(),
            headers_in: HeadersIn::new(),
            headers_out: ResponseHead::new(),
            count: 1,
            blocked: 0,
            #[cfg(debug_assertions)]
            stakeholders: vec!["request"],
            subrequests,
            write_state: WriteState::Empty,
            read_state: ReadState::Head,
            postponed: VecDeque::new(),
            posted: VecDeque::new(),
            post_subrequest: None,
            cleanup: Vec::new(),
            discard_body: false,
            keepalive: false,
            lingering_close: false,
            header_only: false,
            done: false,
            logged: false,
            pipelined: false,
            post_action: false,
            request_complete: false,
            reading_body: false,
            buffered: false,
            expect_continue: false,
            body: None,
            encoder: None,
            server,
            extensions: http::Extensions::new(),
            start_time: Instant::now(),
            start_at: SystemTime::now(),
        }
    }

    pub(crate) fn is_main(&self) -> bool {
        self.id == self.main
    }

    // public accessors for phase handlers

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Normalized request path.
    pub fn path(&self) -> &[u8] {
        &self.uri.path
    }

    /// Raw query string, empty when absent.
    pub fn query(&self) -> &[u8] {
        &self.uri.query
    }

    /// File extension of the path, empty when absent.
    pub fn extension(&self) -> &[u8] {
        &self.uri.ext
    }

    /// The request target exactly as received.
    pub fn raw_uri(&self) -> &[u8] {
        &self.uri.raw
    }

    /// Validated, lowercased host this request resolved against.
    pub fn host(&self) -> Option<&str> {
        self.headers_in.server.as_deref()
    }

    /// Browser-family quirk flags from the `User-Agent` header.
    pub fn browser(&self) -> super::headers::BrowserFlags {
        self.headers_in.browser
    }

    pub fn is_subrequest(&self) -> bool {
        !self.is_main()
    }

    /// True when this request was parsed from leftover bytes of the
    /// previous one on the same connection.
    pub fn is_pipelined(&self) -> bool {
        self.pipelined
    }

    /// True once the response completed normally.
    pub fn is_complete(&self) -> bool {
        self.request_complete
    }

    pub fn server_name(&self) -> &str {
        &self.server.name
    }

    pub fn status(&self) -> StatusCode {
        self.headers_out.status
    }

    pub fn headers_out_mut(&mut self) -> &mut ResponseHead {
        &mut self.headers_out
    }

    /// Per-module context, keyed by type.
    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }

    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    /// Registers a cleanup handler run at teardown, including the forceful
    /// path.
    pub fn add_cleanup(&mut self, f: Box<dyn FnOnce() + Send>) {
        self.cleanup.push(f);
    }
}

/// The per-connection request arena.
pub(crate) struct RequestSet {
    slab: Slab<Request>,
    gens: Vec<u32>,
}

impl RequestSet {
    pub(crate) fn new() -> RequestSet {
        RequestSet {
            slab: Slab::new(),
            gens: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub(crate) fn insert_with<F>(&mut self, build: F) -> ReqId
    where
        F: FnOnce(ReqId) -> Request,
    {
        let entry = self.slab.vacant_entry();
        let idx = entry.key();
        if self.gens.len() <= idx {
            self.gens.resize(idx + 1, 0);
        }
        self.gens[idx] = self.gens[idx].wrapping_add(1);
        let id = ReqId {
            idx: idx as u32,
            gen: self.gens[idx],
        };
        entry.insert(build(id));
        id
    }

    pub(crate) fn get(&self, id: ReqId) -> Option<&Request> {
        if self.gens.get(id.index()) != Some(&id.gen) {
            return None;
        }
        self.slab.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: ReqId) -> Option<&mut Request> {
        if self.gens.get(id.index()) != Some(&id.gen) {
            return None;
        }
        self.slab.get_mut(id.index())
    }

    pub(crate) fn remove(&mut self, id: ReqId) -> Option<Request> {
        if self.gens.get(id.index()) != Some(&id.gen) {
            return None;
        }
        Some(self.slab.remove(id.index()))
    }

    pub(crate) fn contains(&self, id: ReqId) -> bool {
        self.get(id).is_some()
    }

    /// Tears down every request at once; subrequest storage lives until
    /// the whole tree goes.
    pub(crate) fn clear(&mut self) -> Vec<Request> {
        let mut all = Vec::with_capacity(self.slab.len());
        let keys: Vec<usize> = self.slab.iter().map(|(k, _)| k).collect();
        for k in keys {
            all.push(self.slab.remove(k));
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;

    fn server() -> Arc<ServerBlock> {
        Arc::new(ServerBlock::new("test", ServerOptions::default()))
    }

    #[test]
    fn generation_guards_recycled_slots() {
        let mut set = RequestSet::new();
        let a = set.insert_with(|id| Request::new(id, server(), 10));
        assert!(set.contains(a));
        set.remove(a).unwrap();
        assert!(!set.contains(a));

        // the slot is reused; the stale handle must not alias it
        let b = set.insert_with(|id| Request::new(id, server(), 10));
        assert_eq!(a.index(), b.index());
        assert!(!set.contains(a));
        assert!(set.contains(b));
    }

    #[test]
    fn new_request_owns_one_reference() {
        let mut set = RequestSet::new();
        let id = set.insert_with(|id| Request::new(id, server(), 10));
        let r = set.get(id).unwrap();
        assert_eq!(r.count, 1);
        assert_eq!(r.blocked, 0);
        assert!(r.is_main());
    }
}
