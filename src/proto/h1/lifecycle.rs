//! Request lifecycle: finalize, terminate, reference counting, subrequest
//! ordering and the postpone filter.
//!
//! Everything here is synchronous bookkeeping over the connection's
//! request set and outgoing buffer; the connection future supplies I/O and
//! timers around it. [`Engine`] is also the handle phase handlers receive,
//! so the public methods double as the module API.

use bytes::Bytes;
use http::StatusCode;
use tracing::{debug, error, trace};

use crate::error::Parse;
use crate::phase::{AccessEntry, BodyFilter, PhaseResult};
use crate::vhost::VirtualServers;
use crate::{Error, Result};

use super::buffer::HeaderBuffers;
use super::decode::Decoder;
use super::encode;
use super::io::WriteBuf;
use super::request::{Chain, Postponed, ReadState, ReqId, Request, RequestSet, WriteState};
use super::request::PostSubrequest;
use super::uri;

/// How the connection proceeds once the current request tree settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Keepalive,
    Lingering,
    Close,
}

/// Connection-scoped state the lifecycle shares with the connection
/// future.
pub(crate) struct ConnFlags {
    pub error: bool,
    pub timedout: bool,
    /// Exactly one request in the tree may emit bytes at a time.
    pub current_writer: Option<ReqId>,
    pub root: Option<ReqId>,
    pub disposition: Option<Disposition>,
    /// The discard drain continues under the lingering timers.
    pub discard_drain: bool,
    pub pending_logs: Vec<AccessEntry>,
    /// Server name negotiated during the TLS handshake, if any.
    pub sni_host: Option<String>,
    /// Client-certificate verification is on; SNI/Host mismatch is fatal.
    pub tls_verify: bool,
    /// Addresses from a consumed PROXY protocol prefix.
    pub proxied: Option<super::intake::ProxiedAddrs>,
    /// Body bytes read past the header buffers, awaiting a handler.
    pub body_buf: Vec<u8>,
}

impl ConnFlags {
    pub(crate) fn new() -> ConnFlags {
        ConnFlags {
            error: false,
            timedout: false,
            current_writer: None,
            root: None,
            disposition: None,
            discard_drain: false,
            pending_logs: Vec::new(),
            sni_host: None,
            tls_verify: false,
            proxied: None,
            body_buf: Vec::new(),
        }
    }
}

/// Handle through which phase handlers (and the connection itself) drive a
/// request.
pub struct Engine<'a> {
    pub(crate) requests: &'a mut RequestSet,
    pub(crate) write_buf: &'a mut WriteBuf,
    pub(crate) read_bufs: &'a mut HeaderBuffers,
    pub(crate) flags: &'a mut ConnFlags,
    pub(crate) filters: &'a mut Vec<Box<dyn BodyFilter>>,
    pub(crate) vhosts: &'a VirtualServers,
}

/// Result of one body read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum BodyRead {
    Chunk(Bytes),
    /// Nothing buffered; the request re-enters the pipeline when bytes
    /// arrive.
    Again,
    Eof,
}

impl<'a> Engine<'a> {
    fn main_of(&self, id: ReqId) -> ReqId {
        self.requests.get(id).map(|r| r.main).unwrap_or(id)
    }

    /// Immutable request access for handlers.
    pub fn request(&self, id: ReqId) -> &Request {
        self.requests.get(id).expect("stale request id")
    }

    pub fn request_mut(&mut self, id: ReqId) -> &mut Request {
        self.requests.get_mut(id).expect("stale request id")
    }

    /// Looks a request header up by name; subrequests see the client
    /// request's headers.
    pub fn header(&self, id: ReqId, name: &str) -> Option<&[u8]> {
        let main = self.main_of(id);
        let hin = &self.requests.get(main)?.headers_in;
        for line in &hin.lines {
            if self
                .read_bufs
                .slice(line.name)
                .eq_ignore_ascii_case(name.as_bytes())
            {
                return Some(self.read_bufs.slice(line.value));
            }
        }
        None
    }

    /// Peer addresses recovered from a PROXY protocol prefix, if one was
    /// configured and present.
    pub fn proxied_addrs(&self) -> Option<super::intake::ProxiedAddrs> {
        self.flags.proxied
    }

    fn header_values(&self, id: ReqId, idxs: &[usize]) -> Vec<&[u8]> {
        let main = self.main_of(id);
        let hin = &self.request(main).headers_in;
        idxs.iter()
            .map(|&i| self.read_bufs.slice(hin.lines[i].value))
            .collect()
    }

    /// `Cookie` header values, in arrival order.
    pub fn cookies(&self, id: ReqId) -> Vec<&[u8]> {
        let main = self.main_of(id);
        let idxs = self.request(main).headers_in.cookies.clone();
        self.header_values(id, &idxs)
    }

    /// `X-Forwarded-For` header values, in arrival order.
    pub fn x_forwarded_for(&self, id: ReqId) -> Vec<&[u8]> {
        let main = self.main_of(id);
        let idxs = self.request(main).headers_in.x_forwarded_for.clone();
        self.header_values(id, &idxs)
    }

    /// The `User-Agent` header value, if one was sent.
    pub fn user_agent(&self, id: ReqId) -> Option<&[u8]> {
        let main = self.main_of(id);
        let hin = &self.request(main).headers_in;
        hin.user_agent
            .map(|i| self.read_bufs.slice(hin.lines[i].value))
    }

    /// The `Authorization` header value, if one was sent.
    pub fn authorization(&self, id: ReqId) -> Option<&[u8]> {
        let main = self.main_of(id);
        let hin = &self.request(main).headers_in;
        hin.authorization
            .map(|i| self.read_bufs.slice(hin.lines[i].value))
    }

    /// The `If-Modified-Since` header value, if one was sent.
    pub fn if_modified_since(&self, id: ReqId) -> Option<&[u8]> {
        let main = self.main_of(id);
        let hin = &self.request(main).headers_in;
        hin.if_modified_since
            .map(|i| self.read_bufs.slice(hin.lines[i].value))
    }

    /// All request header lines in wire order.
    pub fn headers(&self, id: ReqId) -> impl Iterator<Item = (&[u8], &[u8])> {
        let main = self.main_of(id);
        let hin = &self.request(main).headers_in;
        let bufs = &*self.read_bufs;
        hin.lines
            .iter()
            .map(move |l| (bufs.slice(l.name), bufs.slice(l.value)))
    }

    // ===== reference counting =====

    /// Registers a new asynchronous stakeholder in the request.
    pub fn acquire(&mut self, id: ReqId, who: &'static str) {
        let main = self.main_of(id);
        let r = self.request_mut(main);
        r.count += 1;
        #[cfg(debug_assertions)]
        r.stakeholders.push(who);
        #[cfg(not(debug_assertions))]
        let _ = who;
        trace!("http request count:{} acquire", self.request(main).count);
    }

    /// Drops a stakeholder reference; the last one out frees the request.
    pub fn release(&mut self, id: ReqId) {
        self.close_request(id);
    }

    /// Marks work that must finish before memory may be released, even at
    /// count zero.
    pub fn block(&mut self, id: ReqId, who: &'static str) {
        let main = self.main_of(id);
        let r = self.request_mut(main);
        r.blocked += 1;
        #[cfg(debug_assertions)]
        r.stakeholders.push(who);
        #[cfg(not(debug_assertions))]
        let _ = who;
    }

    pub fn unblock(&mut self, id: ReqId) {
        let main = self.main_of(id);
        let r = self.request_mut(main);
        debug_assert!(r.blocked > 0, "unbalanced unblock");
        r.blocked = r.blocked.saturating_sub(1);
        if r.blocked == 0 && r.write_state == WriteState::Terminate {
            r.count = 1;
            self.close_request(main);
        }
    }

    // ===== output =====

    /// Serializes the response head. Only the client-facing request emits
    /// one; subrequest heads are silently dropped.
    pub fn send_header(&mut self, id: ReqId) -> Result<()> {
        let main = self.main_of(id);
        if id != main {
            return Ok(());
        }
        let r = self.requests.get_mut(main).ok_or_else(Error::new_internal)?;
        if r.headers_out.sent {
            return Ok(());
        }
        let encoder = encode::encode_head(
            &mut r.headers_out,
            r.version,
            r.keepalive,
            r.header_only,
            self.write_buf,
        );
        if matches!(encoder, encode::Encoder::CloseDelimited) {
            r.keepalive = false;
        }
        r.encoder = Some(encoder);
        Ok(())
    }

    /// Emits response body bytes from `id`. Ordering across the subrequest
    /// tree is enforced here: a request that does not hold the write baton
    /// has its output postponed. `last` ends the (spliced) response body.
    pub fn output(&mut self, id: ReqId, data: impl Into<Bytes>, last: bool) -> Result<()> {
        let mut chain = Chain {
            data: vec![data.into()],
            last,
        };
        chain.data.retain(|b| !b.is_empty());
        for f in self.filters.iter_mut() {
            f.filter(id, &mut chain.data)?;
        }
        self.postpone_filter(id, Some(chain))
    }

    /// The postpone filter: every output attempt funnels through here.
    pub(crate) fn postpone_filter(&mut self, id: ReqId, input: Option<Chain>) -> Result<()> {
        let main = self.main_of(id);

        if self.flags.current_writer != Some(id) {
            if let Some(chain) = input {
                trace!("postponing output while not the writer");
                self.request_mut(id).postponed.push_back(Postponed::Data(chain));
            }
            return Ok(());
        }

        if self.request(id).postponed.is_empty() {
            if let Some(chain) = input {
                return self.write_filter(main, chain);
            }
            return Ok(());
        }

        if let Some(chain) = input {
            self.request_mut(id).postponed.push_back(Postponed::Data(chain));
        }

        // flush queued data until a child takes over the baton
        loop {
            enum Next {
                Sub(ReqId),
                Data(Chain),
                Empty,
            }
            let next = {
                let r = self.request_mut(id);
                match r.postponed.front() {
                    None => Next::Empty,
                    Some(Postponed::Sub(sid)) => Next::Sub(*sid),
                    Some(Postponed::Data(_)) => match r.postponed.pop_front() {
                        Some(Postponed::Data(chain)) => Next::Data(chain),
                        _ => unreachable!("front was data"),
                    },
                }
            };
            match next {
                Next::Empty => return Ok(()),
                Next::Sub(sid) => {
                    trace!("write baton moves to subrequest");
                    self.flags.current_writer = Some(sid);
                    self.post(sid);
                    return Ok(());
                }
                Next::Data(chain) => self.write_filter(main, chain)?,
            }
        }
    }

    /// Terminal output stage: frames bytes with the main request's encoder
    /// into the connection write buffer.
    fn write_filter(&mut self, main: ReqId, chain: Chain) -> Result<()> {
        let r = self.requests.get_mut(main).ok_or_else(Error::new_internal)?;
        if !r.headers_out.sent {
            error!("output before response header was sent");
            return Err(Error::new_internal());
        }
        let encoder = r.encoder.as_mut().expect("encoder set with header");
        for b in chain.data {
            encoder.frame(b, self.write_buf);
        }
        if chain.last {
            encoder.finish(self.write_buf);
        }
        Ok(())
    }

    // ===== body =====

    /// Starts (or continues) reading the request body. A pending
    /// `Expect: 100-continue` is answered on the first call.
    pub fn read_body(&mut self, id: ReqId) -> Result<BodyRead> {
        let main = self.main_of(id);
        let r = self.requests.get_mut(main).ok_or_else(Error::new_internal)?;
        if r.expect_continue {
            r.expect_continue = false;
            self.write_buf.extend(b"HTTP/1.1 100 Continue\r\n\r\n");
        }
        let decoder = match r.body {
            Some(ref mut d) if !d.is_eof() => d,
            _ => {
                r.reading_body = false;
                if r.read_state == ReadState::Body {
                    r.read_state = ReadState::Test;
                }
                return Ok(BodyRead::Eof);
            }
        };

        // the tail preread into the header buffers drains first, then
        // whatever the connection buffered past them
        let (avail, from_headers) = if !self.read_bufs.unparsed().is_empty() {
            (self.read_bufs.unparsed().to_vec(), true)
        } else if !self.flags.body_buf.is_empty() {
            (std::mem::take(&mut self.flags.body_buf), false)
        } else {
            r.reading_body = true;
            r.read_state = ReadState::Body;
            return Ok(BodyRead::Again);
        };

        let mut out = Vec::new();
        let consumed = decoder
            .decode(&avail, Some(&mut out))
            .map_err(Error::new_parse)?;
        let done = decoder.is_eof();
        if done {
            r.reading_body = false;
            if r.read_state == ReadState::Body {
                r.read_state = ReadState::Test;
            }
        } else {
            r.reading_body = true;
            r.read_state = ReadState::Body;
        }
        if from_headers {
            self.read_bufs.pos += consumed;
        } else if consumed < avail.len() {
            // body framing ended inside the buffered run; keep the rest
            self.flags.body_buf = avail[consumed..].to_vec();
        }
        if out.is_empty() {
            return Ok(if done { BodyRead::Eof } else { BodyRead::Again });
        }
        Ok(BodyRead::Chunk(Bytes::from(out)))
    }

    /// Arranges for an unread body to be drained in the background so the
    /// connection can be reused.
    pub fn discard_body(&mut self, id: ReqId) {
        let main = self.main_of(id);
        let r = self.request_mut(main);
        match r.body {
            Some(ref d) if !d.is_eof() => {
                r.discard_body = true;
                r.expect_continue = false;
                r.read_state = ReadState::DiscardBody;
            }
            _ => {}
        }
    }

    // ===== subrequests =====

    /// Spawns a subrequest whose output is spliced into the response at
    /// the current position of `parent`'s output.
    pub fn subrequest(
        &mut self,
        parent: ReqId,
        target: &str,
        post: Option<PostSubrequest>,
    ) -> Result<ReqId> {
        let main = self.main_of(parent);
        let budget = self.request(parent).subrequests;
        if budget == 0 {
            debug!("subrequest depth limit reached");
            return Err(Error::new_subrequest_limit());
        }

        self.request_mut(main).count += 1;
        #[cfg(debug_assertions)]
        self.request_mut(main).stakeholders.push("subrequest");

        let (server, version) = {
            let p = self.request(parent);
            (p.server.clone(), p.version)
        };
        let (path, query) = target.split_at(target.find('?').unwrap_or(target.len()));
        let sid = self.requests.insert_with(|id| {
            let mut r = Request::new(id, server, budget - 1);
            r.parent = Some(parent);
            r.main = main;
            r.version = version;
            r.uri.path = Bytes::copy_from_slice(path.as_bytes());
            r.uri.query = Bytes::copy_from_slice(query.trim_start_matches('?').as_bytes());
            r.uri.ext = Bytes::copy_from_slice(uri::extension(path.as_bytes()));
            r.uri.raw = Bytes::copy_from_slice(target.as_bytes());
            r.post_subrequest = post;
            r.write_state = WriteState::Phases;
            r
        });

        trace!("http subrequest {:?}", target);

        let was_empty = self.request(parent).postponed.is_empty();
        self.request_mut(parent)
            .postponed
            .push_back(Postponed::Sub(sid));
        // the child streams first only if its parent held the baton with
        // nothing queued ahead
        if self.flags.current_writer == Some(parent) && was_empty {
            self.flags.current_writer = Some(sid);
        }
        self.post(sid);
        Ok(sid)
    }

    /// Queues a request on the root's posted-requests FIFO; drained after
    /// every top-level handler.
    pub fn post(&mut self, id: ReqId) {
        let main = self.main_of(id);
        if !self.requests.contains(main) {
            return;
        }
        self.request_mut(main).posted.push_back(id);
    }

    pub(crate) fn take_posted(&mut self) -> Option<ReqId> {
        let root = self.flags.root?;
        let r = self.requests.get_mut(root)?;
        r.posted.pop_front()
    }

    // ===== finalize =====

    /// The single entry point for "this handler's phase is done".
    pub fn finalize(&mut self, id: ReqId, rc: PhaseResult) {
        let r = match self.requests.get(id) {
            Some(r) => r,
            None => return,
        };
        trace!(
            "http finalize request rc: {:?} a:{} c:{} ps:{}",
            rc,
            self.flags.current_writer == Some(id),
            self.requests.get(r.main).map(|m| m.count).unwrap_or(0),
            r.postponed.len(),
        );

        if rc == PhaseResult::Done {
            self.finalize_connection(id);
            return;
        }

        if rc == PhaseResult::Declined {
            let r = self.request_mut(id);
            r.write_state = WriteState::Phases;
            self.post(id);
            return;
        }

        // subrequest completion callback may rewrite the result
        let mut rc = rc;
        let is_main = self.request(id).is_main();
        if !is_main {
            if let Some(mut cb) = self.request_mut(id).post_subrequest.take() {
                rc = cb(id, rc);
            }
        }

        let terminal_status = match rc {
            PhaseResult::Status(s) if s == StatusCode::REQUEST_TIMEOUT => Some(s),
            _ => None,
        };
        if rc == PhaseResult::Error || terminal_status.is_some() || self.flags.error {
            let main = self.main_of(id);
            if self.request(main).blocked > 0 {
                self.request_mut(main).write_state = WriteState::Terminate;
            }
            self.terminate(id, terminal_status);
            return;
        }

        if rc == PhaseResult::Close {
            self.terminate(id, None);
            return;
        }

        if rc.is_special() {
            let status = match rc {
                PhaseResult::Status(s) => s,
                _ => unreachable!("is_special implies a status"),
            };
            let rc2 = self.special_response(id, status);
            self.finalize(id, rc2);
            return;
        }

        if !is_main {
            let r = self.request(id);
            if r.buffered || !r.postponed.is_empty() {
                self.set_write_handler(id);
                return;
            }

            let parent = self.request(id).parent.expect("subrequest has parent");
            let main = self.main_of(id);

            if self.flags.current_writer == Some(id) {
                // active subrequest: its output is fully on the wire
                self.request_mut(main).count -= 1;

                let log = {
                    let r = self.request_mut(id);
                    let first = !r.logged;
                    r.logged = true;
                    r.done = true;
                    first
                };
                if log && self.request(id).server.options.log_subrequest {
                    let entry = self.log_entry(id);
                    self.flags.pending_logs.push(entry);
                }

                let pr = self.request_mut(parent);
                if matches!(pr.postponed.front(), Some(Postponed::Sub(s)) if *s == id) {
                    pr.postponed.pop_front();
                }
                trace!("write baton returns to parent");
                self.flags.current_writer = Some(parent);
            } else {
                debug!("http finalize non-active request");
                let r = self.request_mut(id);
                r.write_state = WriteState::Finalizer;
                r.done = true;
            }

            self.post(parent);
            return;
        }

        // the client-facing request
        {
            let r = self.request(id);
            if r.buffered || !r.postponed.is_empty() || r.blocked > 0 {
                self.set_write_handler(id);
                return;
            }
        }

        // on a clean completion, end the body framing; a re-finalize from
        // the write driver finds it already done
        if rc == PhaseResult::Ok {
            let r = self.requests.get_mut(id).expect("stale request id");
            if let Some(enc) = r.encoder.as_mut() {
                if !enc.is_done() {
                    enc.finish(self.write_buf);
                }
            }
        }

        if !self.write_buf.is_empty() {
            self.set_write_handler(id);
            return;
        }

        if self.flags.current_writer != Some(id) {
            error!("http finalize non-active main request");
            return;
        }

        {
            let r = self.request_mut(id);
            r.done = true;
            r.write_state = WriteState::Empty;
            if !r.post_action {
                r.request_complete = true;
            }
        }

        if self.post_action(id) {
            return;
        }

        self.finalize_connection(id);
    }

    /// The forceful teardown path: run cleanups, then close as soon as no
    /// blocking actor remains.
    pub fn terminate(&mut self, id: ReqId, status: Option<StatusCode>) {
        let main = self.main_of(id);
        let r = match self.requests.get_mut(main) {
            Some(r) => r,
            None => return,
        };
        debug!("http terminate request count:{}", r.count);

        if let Some(s) = status {
            if !r.headers_out.sent {
                r.headers_out.status = s;
            }
        }

        let cleanups = std::mem::take(&mut r.cleanup);
        for c in cleanups {
            c();
        }

        let r = self.request_mut(main);
        if r.blocked > 0 {
            r.write_state = WriteState::Terminate;
            r.posted.clear();
            return;
        }

        r.posted.clear();
        r.count = 1;
        self.close_request(main);
    }

    /// Count accounting at the end of a request: keepalive, lingering
    /// close, or plain close.
    pub(crate) fn finalize_connection(&mut self, id: ReqId) {
        let main = self.main_of(id);
        let (count, discard_body) = {
            let r = match self.requests.get(main) {
                Some(r) => r,
                None => return,
            };
            (r.count, r.discard_body)
        };

        if count != 1 {
            if discard_body {
                self.request_mut(main).read_state = ReadState::DiscardBody;
                self.flags.discard_drain = true;
            }
            self.close_request(main);
            return;
        }

        {
            let r = self.request_mut(main);
            if r.reading_body {
                r.keepalive = false;
                r.lingering_close = true;
            }
        }

        let r = self.request(main);
        let opts = &r.server.options;
        let body_clean = match r.body {
            Some(ref d) => d.is_eof(),
            None => true,
        };

        if !self.flags.error
            && !self.flags.timedout
            && r.keepalive
            && body_clean
            && !opts.keepalive_timeout.is_zero()
        {
            self.set_keepalive(main);
            return;
        }

        let lingering = match opts.lingering_close {
            crate::config::LingeringClose::Always => true,
            crate::config::LingeringClose::On => {
                r.lingering_close || r.discard_body || !self.read_bufs.unparsed().is_empty()
            }
            crate::config::LingeringClose::Off => false,
        };
        // a timed-out connection that resets never lingers
        let lingering = lingering && !(self.flags.timedout && opts.reset_timedout_connection);

        if lingering {
            debug!("http set lingering close");
            self.flags.disposition = Some(Disposition::Lingering);
            return;
        }

        self.close_request(main);
    }

    fn set_keepalive(&mut self, main: ReqId) {
        debug!("set http keepalive handler");
        // guard against re-entry from finalize_connection
        self.request_mut(main).keepalive = false;
        self.free_request(main);
        self.flags.disposition = Some(Disposition::Keepalive);
    }

    /// Drops one reference; at zero (and not blocked) the request is freed
    /// and the connection moves toward close.
    pub(crate) fn close_request(&mut self, id: ReqId) {
        let main = self.main_of(id);
        let r = match self.requests.get_mut(main) {
            Some(r) => r,
            None => return,
        };
        if r.count == 0 {
            error!("http request count is zero");
        }
        r.count = r.count.saturating_sub(1);
        trace!("http close request count:{} blk:{}", r.count, r.blocked);
        if r.count > 0 || r.blocked > 0 {
            return;
        }

        self.free_request(main);
        if self.flags.disposition.is_none() {
            self.flags.disposition = Some(Disposition::Close);
        }
    }

    /// Releases the whole request tree, logging first.
    fn free_request(&mut self, main: ReqId) {
        trace!("http free request");
        let need_log = self.requests.get(main).map(|r| !r.logged).unwrap_or(false);
        if need_log {
            let entry = self.log_entry(main);
            self.flags.pending_logs.push(entry);
        }
        let all = self.requests.clear();
        for mut r in all {
            for c in std::mem::take(&mut r.cleanup) {
                c();
            }
        }
        self.flags.root = None;
        self.flags.current_writer = None;
    }

    fn log_entry(&self, id: ReqId) -> AccessEntry {
        let r = self.request(id);
        AccessEntry {
            method: r.method.clone(),
            path: r.uri.path.clone(),
            status: if r.headers_out.sent || r.done {
                Some(r.headers_out.status)
            } else {
                None
            },
            sent: 0,
            subrequest: !r.is_main(),
            server: r.server.name.clone(),
            at: r.start_at,
        }
    }

    /// Builds the canned response for a non-2xx terminal status, re-using
    /// the normal output path.
    pub(crate) fn special_response(&mut self, id: ReqId, status: StatusCode) -> PhaseResult {
        let main = self.main_of(id);
        let is_main = id == main;

        {
            let r = self.request_mut(id);
            r.headers_out.status = status;
        }

        if !is_main {
            // a failed subrequest contributes no bytes of its own
            return PhaseResult::Ok;
        }

        {
            let r = self.request_mut(main);
            if r.keepalive {
                match status {
                    StatusCode::BAD_REQUEST
                    | StatusCode::PAYLOAD_TOO_LARGE
                    | StatusCode::URI_TOO_LONG
                    | StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
                    | StatusCode::INTERNAL_SERVER_ERROR
                    | StatusCode::NOT_IMPLEMENTED => r.keepalive = false,
                    _ => {}
                }
            }
        }

        if self.request(main).headers_out.sent {
            // too late for a clean error page
            return PhaseResult::Error;
        }

        self.discard_body(main);

        let body = canned_page(status);
        {
            let r = self.request_mut(main);
            r.headers_out.content_length = Some(body.as_ref().map(|b| b.len() as u64).unwrap_or(0));
        }
        if self.send_header(main).is_err() {
            return PhaseResult::Error;
        }
        let chain = Chain {
            data: body.into_iter().collect(),
            last: true,
        };
        if self.postpone_filter(main, Some(chain)).is_err() {
            return PhaseResult::Error;
        }
        PhaseResult::Ok
    }

    /// Installs the write driver as the request's continuation.
    pub(crate) fn set_write_handler(&mut self, id: ReqId) {
        let r = self.request_mut(id);
        r.read_state = if r.discard_body {
            ReadState::DiscardBody
        } else if r.read_state == ReadState::Body {
            ReadState::Body
        } else {
            ReadState::Test
        };
        r.write_state = WriteState::Writer;
    }

    fn post_action(&mut self, id: ReqId) -> bool {
        let main = self.main_of(id);
        let target = {
            let r = self.request(main);
            if r.post_action {
                return false;
            }
            match r.server.options.post_action {
                Some(ref uri) => uri.clone(),
                None => return false,
            }
        };
        debug!("post action: {:?}", target);
        let r = self.request_mut(main);
        r.post_action = true;
        r.uri.path = Bytes::from(target.into_bytes());
        r.uri.query = Bytes::new();
        r.write_state = WriteState::Phases;
        self.post(main);
        true
    }

    // ===== head processing support =====

    /// Re-resolves the virtual server after a `Host` header or SNI pick.
    pub(crate) fn set_virtual_server(&mut self, id: ReqId, host: &str) -> Result<()> {
        // SNI agreement check: with client-cert verification on, the Host
        // must match the negotiated name
        if let Some(ref sni) = self.flags.sni_host {
            if self.flags.tls_verify && sni != host {
                debug!(
                    "client attempted to request the server name \
                     different from the one negotiated"
                );
                return Err(Error::new_parse(Parse::HostMismatch));
            }
        }
        let server = self.vhosts.resolve_or_default(host).clone();
        trace!(server = %server.name, "virtual server selected");
        self.request_mut(id).server = server;
        Ok(())
    }

    /// Sets up body framing after the head is validated.
    pub(crate) fn prepare_body(&mut self, id: ReqId) {
        let r = self.request_mut(id);
        r.body = if r.headers_in.chunked {
            Some(Decoder::chunked())
        } else {
            match r.headers_in.content_length_n {
                Some(n) if n > 0 => Some(Decoder::length(n)),
                _ => None,
            }
        };
    }
}

fn canned_page(status: StatusCode) -> Option<Bytes> {
    if status.as_u16() < 300
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return None;
    }
    let code = status.as_u16();
    let reason = status.canonical_reason().unwrap_or("Error");
    let page = format!(
        "<html>\r\n<head><title>{code} {reason}</title></head>\r\n\
         <body>\r\n<center><h1>{code} {reason}</h1></center>\r\n\
         <hr><center>gable</center>\r\n</body>\r\n</html>\r\n",
        code = code,
        reason = reason,
    );
    Some(Bytes::from(page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::vhost::ServerBlock;
    use std::sync::Arc;

    struct Harness {
        requests: RequestSet,
        write_buf: WriteBuf,
        read_bufs: HeaderBuffers,
        flags: ConnFlags,
        filters: Vec<Box<dyn BodyFilter>>,
        vhosts: VirtualServers,
    }

    impl Harness {
        fn new() -> Harness {
            Harness::with_options(ServerOptions::default())
        }

        fn with_options(opts: ServerOptions) -> Harness {
            Harness {
                requests: RequestSet::new(),
                write_buf: WriteBuf::for_tests(),
                read_bufs: HeaderBuffers::new(1024, 4, 8192),
                flags: ConnFlags::new(),
                filters: Vec::new(),
                vhosts: VirtualServers::single(ServerBlock::new("test", opts)),
            }
        }

        fn engine(&mut self) -> Engine<'_> {
            Engine {
                requests: &mut self.requests,
                write_buf: &mut self.write_buf,
                read_bufs: &mut self.read_bufs,
                flags: &mut self.flags,
                filters: &mut self.filters,
                vhosts: &self.vhosts,
            }
        }

        fn root(&mut self) -> ReqId {
            let server = self.vhosts.default_server().clone();
            let id = self
                .requests
                .insert_with(|id| Request::new(id, server, 50));
            self.flags.root = Some(id);
            self.flags.current_writer = Some(id);
            self.requests.get_mut(id).unwrap().keepalive = true;
            id
        }

        fn wire(&mut self) -> Vec<u8> {
            self.write_buf.take_for_tests()
        }
    }

    fn send_simple_header(h: &mut Harness, id: ReqId) {
        // a known length avoids chunked framing noise in assertions
        h.requests.get_mut(id).unwrap().headers_out.content_length = Some(1024);
        h.engine().send_header(id).unwrap();
        let _ = h.wire();
    }

    #[test]
    fn emit_with_baton_goes_to_wire() {
        let mut h = Harness::new();
        let id = h.root();
        send_simple_header(&mut h, id);
        h.engine().output(id, &b"hello"[..], false).unwrap();
        assert_eq!(h.wire(), b"hello");
    }

    #[test]
    fn emit_without_baton_is_postponed() {
        let mut h = Harness::new();
        let id = h.root();
        send_simple_header(&mut h, id);
        h.flags.current_writer = None;
        h.engine().output(id, &b"hello"[..], false).unwrap();
        assert!(h.wire().is_empty());
        assert_eq!(h.requests.get(id).unwrap().postponed.len(), 1);
    }

    #[test]
    fn subrequest_tree_orders_output_depth_first() {
        // root emits A, spawns S1 (emits B then C), emits D, spawns S2
        // (emits E); the wire must read ABCDE
        let mut h = Harness::new();
        let root = h.root();
        send_simple_header(&mut h, root);
        let _ = h.wire();

        let mut e = Engine {
            requests: &mut h.requests,
            write_buf: &mut h.write_buf,
            read_bufs: &mut h.read_bufs,
            flags: &mut h.flags,
            filters: &mut h.filters,
            vhosts: &h.vhosts,
        };
        e.output(root, &b"A"[..], false).unwrap();
        let s1 = e.subrequest(root, "/s1", None).unwrap();
        e.output(root, &b"D"[..], false).unwrap();
        let s2 = e.subrequest(root, "/s2", None).unwrap();
        e.finalize(root, PhaseResult::Ok);

        // posted: s1, s2, then handlers run in order
        let posted = e.take_posted();
        assert_eq!(posted, Some(s1));
        e.output(s1, &b"B"[..], false).unwrap();
        e.output(s1, &b"C"[..], false).unwrap();
        e.finalize(s1, PhaseResult::Ok);

        // parent got posted; its write driver flushes D and hands to s2
        let _ = e.take_posted(); // s2 (spawn-time post)
        let parent = e.take_posted();
        assert_eq!(parent, Some(root));
        e.postpone_filter(root, None).unwrap();
        e.output(s2, &b"E"[..], false).unwrap();
        e.finalize(s2, PhaseResult::Ok);
        e.postpone_filter(root, None).unwrap();

        assert_eq!(h.write_buf.take_for_tests(), b"ABCDE");
    }

    #[test]
    fn spawn_transfers_baton_to_first_child() {
        let mut h = Harness::new();
        let root = h.root();
        send_simple_header(&mut h, root);
        let mut e = h.engine();
        let s1 = e.subrequest(root, "/s1", None).unwrap();
        assert_eq!(e.flags.current_writer, Some(s1));
        // a second spawn queues behind the first
        let s2 = e.subrequest(root, "/s2", None).unwrap();
        assert_eq!(e.flags.current_writer, Some(s1));
        let _ = s2;
    }

    #[test]
    fn subrequest_bumps_and_releases_count() {
        let mut h = Harness::new();
        let root = h.root();
        send_simple_header(&mut h, root);
        let mut e = h.engine();
        let s1 = e.subrequest(root, "/s1", None).unwrap();
        assert_eq!(e.request(root).count, 2);
        e.finalize(s1, PhaseResult::Ok);
        assert_eq!(e.request(root).count, 1);
    }

    #[test]
    fn subrequest_depth_budget_enforced() {
        let mut h = Harness::new();
        let root = h.root();
        let mut e = h.engine();
        let mut cur = root;
        for _ in 0..50 {
            cur = e.subrequest(cur, "/deep", None).unwrap();
        }
        assert!(e.subrequest(cur, "/toodeep", None).is_err());
    }

    #[test]
    fn post_subrequest_callback_runs_on_completion() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static RAN: AtomicBool = AtomicBool::new(false);

        let mut h = Harness::new();
        let root = h.root();
        send_simple_header(&mut h, root);
        let mut e = h.engine();
        let s1 = e
            .subrequest(
                root,
                "/cb",
                Some(Box::new(|_, rc| {
                    RAN.store(true, Ordering::SeqCst);
                    rc
                })),
            )
            .unwrap();
        e.finalize(s1, PhaseResult::Ok);
        assert!(RAN.load(Ordering::SeqCst));
    }

    #[test]
    fn count_and_blocked_gate_destruction() {
        let mut h = Harness::new();
        let root = h.root();
        let mut e = h.engine();
        e.acquire(root, "reader");
        e.block(root, "aio");
        e.finalize(root, PhaseResult::Done);
        // reader still holds a reference
        assert!(e.requests.contains(root));
        e.release(root);
        // blocked still pins the memory
        assert!(e.requests.contains(root));
        assert_eq!(e.request(root).count, 0);
        e.unblock(root);
        // terminate was not requested, so the request lives until a final
        // close; blocked alone does not free
        assert!(e.requests.contains(root));
    }

    #[test]
    fn terminate_defers_while_blocked() {
        let mut h = Harness::new();
        let root = h.root();
        let mut e = h.engine();
        e.block(root, "aio");
        e.terminate(root, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(e.requests.contains(root));
        assert_eq!(e.request(root).write_state, WriteState::Terminate);
        e.unblock(root);
        assert!(!e.requests.contains(root));
        assert_eq!(e.flags.disposition, Some(Disposition::Close));
    }

    #[test]
    fn terminate_runs_cleanups() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CLEANED: AtomicUsize = AtomicUsize::new(0);

        let mut h = Harness::new();
        let root = h.root();
        h.requests
            .get_mut(root)
            .unwrap()
            .add_cleanup(Box::new(|| {
                CLEANED.fetch_add(1, Ordering::SeqCst);
            }));
        let mut e = h.engine();
        e.terminate(root, None);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 1);
        assert!(!e.requests.contains(root));
    }

    #[test]
    fn done_with_keepalive_requests_reuse() {
        let mut h = Harness::new();
        let root = h.root();
        {
            let r = h.requests.get_mut(root).unwrap();
            r.keepalive = true;
        }
        let mut e = h.engine();
        e.finalize(root, PhaseResult::Done);
        assert_eq!(e.flags.disposition, Some(Disposition::Keepalive));
        assert!(!e.requests.contains(root));
    }

    #[test]
    fn no_keepalive_goes_to_close() {
        let mut h = Harness::new();
        let root = h.root();
        h.requests.get_mut(root).unwrap().keepalive = false;
        let mut e = h.engine();
        e.finalize(root, PhaseResult::Done);
        assert_eq!(e.flags.disposition, Some(Disposition::Close));
    }

    #[test]
    fn lingering_always_wins_over_plain_close() {
        let mut opts = ServerOptions::default();
        opts.lingering_close(crate::config::LingeringClose::Always);
        let mut h = Harness::with_options(opts);
        let root = h.root();
        h.requests.get_mut(root).unwrap().keepalive = false;
        let mut e = h.engine();
        e.finalize(root, PhaseResult::Done);
        assert_eq!(e.flags.disposition, Some(Disposition::Lingering));
    }

    #[test]
    fn reset_timedout_overrides_lingering_always() {
        let mut opts = ServerOptions::default();
        opts.lingering_close(crate::config::LingeringClose::Always)
            .reset_timedout_connection(true);
        let mut h = Harness::with_options(opts);
        let root = h.root();
        h.requests.get_mut(root).unwrap().keepalive = false;
        h.flags.timedout = true;
        let mut e = h.engine();
        e.finalize(root, PhaseResult::Done);
        assert_eq!(e.flags.disposition, Some(Disposition::Close));
    }

    #[test]
    fn special_response_writes_canned_page() {
        let mut h = Harness::new();
        let root = h.root();
        let mut e = h.engine();
        e.finalize(root, PhaseResult::Status(StatusCode::NOT_FOUND));
        let wire = h.wire();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", text);
        assert!(text.contains("<h1>404 Not Found</h1>"));
    }

    #[test]
    fn special_response_400_disables_keepalive() {
        let mut h = Harness::new();
        let root = h.root();
        h.engine()
            .finalize(root, PhaseResult::Status(StatusCode::BAD_REQUEST));
        // the canned page waits on the write driver
        assert_eq!(
            h.requests.get(root).unwrap().write_state,
            WriteState::Writer
        );
        let wire = h.wire();
        assert!(String::from_utf8_lossy(&wire).contains("Connection: close"));

        // the write driver drained everything and re-finalizes; keepalive
        // was on, yet the connection must close
        let mut e = h.engine();
        e.finalize(root, PhaseResult::Ok);
        assert_eq!(e.flags.disposition, Some(Disposition::Close));
    }

    #[test]
    fn declined_reenters_phases() {
        let mut h = Harness::new();
        let root = h.root();
        let mut e = h.engine();
        e.finalize(root, PhaseResult::Declined);
        assert_eq!(e.request(root).write_state, WriteState::Phases);
        assert_eq!(e.take_posted(), Some(root));
    }

    #[test]
    fn access_log_emitted_once_on_free() {
        let mut h = Harness::new();
        let root = h.root();
        h.requests.get_mut(root).unwrap().keepalive = false;
        let mut e = h.engine();
        e.finalize(root, PhaseResult::Done);
        assert_eq!(h.flags.pending_logs.len(), 1);
        assert!(!h.flags.pending_logs[0].subrequest);
    }

    #[test]
    fn sni_host_mismatch_rejected_with_verify() {
        let mut h = Harness::new();
        let root = h.root();
        h.flags.sni_host = Some("a.example".into());
        h.flags.tls_verify = true;
        let mut e = h.engine();
        let err = e.set_virtual_server(root, "b.example").unwrap_err();
        assert_eq!(err.parse_status(), Some(StatusCode::MISDIRECTED_REQUEST));
        // without verification the mismatch is tolerated
        e.flags.tls_verify = false;
        assert!(e.set_virtual_server(root, "b.example").is_ok());
    }
}
