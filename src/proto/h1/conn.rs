//! The per-connection future.
//!
//! One `Connection` owns the socket from accept to close and serves any
//! number of sequential requests on it. The poll loop is the event
//! dispatcher: it drains the posted-requests queue after every handler,
//! advances whichever read/write continuation is installed, and applies
//! the disposition (`keepalive` / `lingering` / `close`) the lifecycle
//! decided on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, StatusCode, Version};
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, trace};

use crate::error::Parse;
use crate::phase::{BodyFilter, Phases, PhaseResult};
use crate::vhost::{ServerBlock, VirtualServers};
use crate::{Error, Result};

use super::buffer::{Grow, HeaderBuffers, Span};
use super::headers::{self, Dispatched};
use super::intake;
use super::io::{Buffered, Transport};
use super::lifecycle::{ConnFlags, Disposition, Engine};
use super::parse::{self, HeaderCtx, HeaderStatus, RequestLineCtx, Status};
use super::request::{ReadState, ReqId, Request, RequestSet, WriteState};
use super::uri;

/// Upper bound on header lines per request.
const MAX_HEADERS: usize = 100;

const DISCARD_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the first byte of a request (fresh connection).
    WaitRequest,
    ReadingLine,
    ReadingHeaders,
    /// Phase pipeline and write driver own the request.
    Running,
    /// Idle between requests.
    Keepalive,
    /// Write side closed, draining residual client bytes.
    Lingering,
    Closed,
}

struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    fn new() -> Timer {
        Timer { sleep: None }
    }

    fn arm(&mut self, dur: Duration) {
        self.sleep = Some(Box::pin(sleep(dur)));
    }

    fn arm_if_unset(&mut self, dur: Duration) {
        if self.sleep.is_none() {
            self.arm(dur);
        }
    }

    fn disarm(&mut self) {
        self.sleep = None;
    }

    /// True exactly once per expiry; disarms itself.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match self.sleep.as_mut() {
            None => false,
            Some(s) => match s.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.sleep = None;
                    true
                }
                Poll::Pending => false,
            },
        }
    }
}

/// Configures a [`Connection`] before serving.
pub struct Builder {
    vhosts: Arc<VirtualServers>,
    proxy_protocol: bool,
    ssl: bool,
    tls_established: bool,
    sni_host: Option<String>,
    tls_verify: bool,
    preread: Option<Bytes>,
    filters: Vec<Box<dyn BodyFilter>>,
}

impl Builder {
    /// Starts configuring a connection for one listening address's
    /// virtual servers.
    pub fn new(vhosts: Arc<VirtualServers>) -> Builder {
        Builder {
            vhosts,
            proxy_protocol: false,
            ssl: false,
            tls_established: false,
            sni_host: None,
            tls_verify: false,
            preread: None,
            filters: Vec::new(),
        }
    }

    /// The listening socket expects a PROXY protocol v1 prefix.
    pub fn proxy_protocol(mut self, enabled: bool) -> Builder {
        self.proxy_protocol = enabled;
        self
    }

    /// The listening socket is flagged TLS. The handshake itself is the
    /// caller's job (see [`intake::sniff`]); a plaintext request arriving
    /// here is answered with an error instead of being served.
    pub fn ssl(mut self, enabled: bool) -> Builder {
        self.ssl = enabled;
        self
    }

    /// The caller completed a TLS handshake over this stream.
    pub fn tls_established(mut self, established: bool) -> Builder {
        self.tls_established = established;
        self
    }

    /// Server name selected in the SNI callback.
    pub fn sni_host(mut self, host: impl Into<String>) -> Builder {
        self.sni_host = Some(host.into());
        self
    }

    /// Client certificates were required; a Host disagreeing with the SNI
    /// name is rejected.
    pub fn tls_verify(mut self, verify: bool) -> Builder {
        self.tls_verify = verify;
        self
    }

    /// Bytes already consumed from the stream (during protocol sniffing or
    /// the handshake) that belong to the HTTP layer.
    pub fn preread(mut self, bytes: Bytes) -> Builder {
        self.preread = Some(bytes);
        self
    }

    /// Appends a response body filter.
    pub fn body_filter(mut self, f: Box<dyn BodyFilter>) -> Builder {
        self.filters.push(f);
        self
    }

    pub fn serve<T, P>(self, io: T, phases: P) -> Connection<T, P>
    where
        T: Transport + Unpin,
        P: Phases + Unpin,
    {
        let server = self.vhosts.default_server().clone();
        let opts = &server.options;
        let read_bufs = HeaderBuffers::new(
            opts.client_header_buffer_size,
            opts.large_client_header_buffers.0,
            opts.large_client_header_buffers.1,
        );
        let mut flags = ConnFlags::new();
        flags.sni_host = self.sni_host;
        flags.tls_verify = self.tls_verify;

        let mut conn = Connection {
            io: Buffered::new(io, read_bufs),
            requests: RequestSet::new(),
            filters: self.filters,
            phases,
            vhosts: self.vhosts,
            server,
            flags,
            state: State::WaitRequest,
            line_ctx: RequestLineCtx::default(),
            header_ctx: HeaderCtx::new(false),
            header_count: 0,
            read_timer: Timer::new(),
            write_timer: Timer::new(),
            delayed: false,
            shutdown_done: false,
            lingering_deadline: None,
            proxy_pending: self.proxy_protocol,
            ssl: self.ssl,
            tls_established: self.tls_established,
            sent_base: 0,
            requests_served: 0,
            fatal: None,
        };
        if let Some(bytes) = self.preread {
            conn.seed_preread(&bytes);
        }
        conn
    }
}

/// Serves HTTP/1.x requests on one accepted stream until it closes.
///
/// Resolves once the connection is fully shut down; transport failures and
/// protocol violations that close the connection without a response are
/// surfaced as errors.
pub struct Connection<T, P> {
    io: Buffered<T>,
    requests: RequestSet,
    filters: Vec<Box<dyn BodyFilter>>,
    phases: P,
    vhosts: Arc<VirtualServers>,
    /// Currently selected server block (the address default until a host
    /// resolves).
    server: Arc<ServerBlock>,
    flags: ConnFlags,
    state: State,
    line_ctx: RequestLineCtx,
    header_ctx: HeaderCtx,
    header_count: usize,
    read_timer: Timer,
    write_timer: Timer,
    /// Rate-limit back-off is in force; a write timeout is not a client
    /// problem while set.
    delayed: bool,
    shutdown_done: bool,
    lingering_deadline: Option<Instant>,
    proxy_pending: bool,
    ssl: bool,
    tls_established: bool,
    /// `io.total_sent` at the start of the current request.
    sent_base: u64,
    requests_served: u64,
    fatal: Option<Error>,
}

impl<T, P> Connection<T, P>
where
    T: Transport + Unpin,
    P: Phases + Unpin,
{
    pub fn new(io: T, vhosts: Arc<VirtualServers>, phases: P) -> Connection<T, P> {
        Builder::new(vhosts).serve(io, phases)
    }

    /// Requests completed on this connection so far.
    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    fn seed_preread(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let n = self.io.read_bufs.fill(bytes);
            if n == 0 {
                // pathological preread larger than the whole pool
                self.fatal = Some(Error::new_parse(Parse::TooLarge));
                self.state = State::Closed;
                return;
            }
            bytes = &bytes[n..];
            if !bytes.is_empty() {
                let token = Some(self.io.read_bufs.pos);
                if self.io.read_bufs.grow(token) == Grow::Exhausted {
                    self.fatal = Some(Error::new_parse(Parse::TooLarge));
                    self.state = State::Closed;
                    return;
                }
            }
        }
    }

    fn engine(&mut self) -> Engine<'_> {
        Engine {
            requests: &mut self.requests,
            write_buf: &mut self.io.write_buf,
            read_bufs: &mut self.io.read_bufs,
            flags: &mut self.flags,
            filters: &mut self.filters,
            vhosts: &self.vhosts,
        }
    }

    fn create_request(&mut self, pipelined: bool) -> ReqId {
        let server = self.vhosts.default_server().clone();
        self.server = server.clone();
        let budget = server.options.max_subrequests;
        let id = self.requests.insert_with(|rid| {
            let mut r = Request::new(rid, server, budget);
            r.pipelined = pipelined;
            r
        });
        self.flags.root = Some(id);
        self.flags.current_writer = Some(id);
        self.line_ctx = RequestLineCtx::default();
        self.header_ctx = HeaderCtx::new(self.server.options.underscores_in_headers);
        self.header_count = 0;
        self.sent_base = self.io.total_sent;
        self.delayed = false;
        trace!(pipelined, "http request created");
        id
    }

    fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if self.flags.timedout && self.server.options.reset_timedout_connection {
            if let Err(e) = self.io.transport().reset_on_close() {
                debug!("SO_LINGER reset failed: {}", e);
            }
        }
        if self.flags.error && self.fatal.is_none() {
            self.fatal = Some(Error::new_terminated(None));
        }
        trace!("close http connection");
        self.state = State::Closed;
    }

    fn drain_logs(&mut self) {
        let sent = self.io.total_sent.saturating_sub(self.sent_base);
        for mut entry in self.flags.pending_logs.drain(..) {
            if entry.sent == 0 {
                entry.sent = sent;
            }
            self.phases.access_log(&entry);
        }
    }

    /// Runs one posted request's installed write continuation.
    fn invoke(&mut self, id: ReqId) {
        let ws = match self.requests.get(id) {
            Some(r) => r.write_state,
            None => return,
        };
        trace!("http run request: {:?}", ws);
        match ws {
            WriteState::Phases => {
                let rc = {
                    let mut engine = Engine {
                        requests: &mut self.requests,
                        write_buf: &mut self.io.write_buf,
                        read_bufs: &mut self.io.read_bufs,
                        flags: &mut self.flags,
                        filters: &mut self.filters,
                        vhosts: &self.vhosts,
                    };
                    self.phases.run(id, &mut engine)
                };
                if rc == PhaseResult::Again {
                    // the handler suspended itself; its continuation (body
                    // bytes, a posted wakeup) re-enters the pipeline
                    trace!("phase handler suspended");
                    return;
                }
                if let Some(r) = self.requests.get_mut(id) {
                    if r.write_state == WriteState::Phases {
                        r.write_state = WriteState::Empty;
                    }
                }
                self.engine().finalize(id, rc);
            }
            WriteState::Writer => self.run_writer(id),
            WriteState::Finalizer => {
                self.engine().finalize(id, PhaseResult::Ok);
            }
            WriteState::Terminate => {
                let mut e = self.engine();
                if let Some(r) = e.requests.get_mut(id) {
                    r.count = 1;
                }
                e.close_request(id);
            }
            WriteState::Empty => {}
        }
    }

    /// The write driver: flush previously buffered chains, then either
    /// re-arm or finish.
    fn run_writer(&mut self, id: ReqId) {
        if self.engine().postpone_filter(id, None).is_err() {
            self.engine().terminate(id, Some(StatusCode::INTERNAL_SERVER_ERROR));
            return;
        }
        let still_buffered = {
            let pending = !self.io.write_buf.is_empty();
            match self.requests.get(id) {
                Some(r) => pending || r.buffered || !r.postponed.is_empty(),
                None => return,
            }
        };
        if still_buffered {
            if !self.delayed {
                self.write_timer
                    .arm_if_unset(self.server.options.send_timeout);
            }
            return;
        }
        trace!("http writer done");
        if let Some(r) = self.requests.get_mut(id) {
            r.write_state = WriteState::Empty;
        }
        self.engine().finalize(id, PhaseResult::Ok);
    }

    /// Bytes the rate limiter still allows on the wire right now.
    fn rate_allowance(&self) -> u64 {
        let rate = self.server.options.limit_rate;
        if rate == 0 {
            return u64::MAX;
        }
        let root = match self.flags.root.and_then(|id| self.requests.get(id)) {
            Some(r) => r,
            None => return u64::MAX,
        };
        let elapsed = root.start_time.elapsed().as_secs() + 1;
        let sent = self.io.total_sent - self.sent_base;
        (rate * elapsed).saturating_sub(sent)
    }

    /// Arms the throttle wakeup after the limiter ran dry.
    fn arm_rate_delay(&mut self) {
        let rate = self.server.options.limit_rate.max(1);
        // one buffer's worth of budget accumulates in at most a second
        let ms = 1000u64.min(1000 * DISCARD_BUFFER_SIZE as u64 / rate).max(1);
        self.delayed = true;
        self.write_timer.arm(Duration::from_millis(ms));
        debug!("http writer delayed for {}ms", ms);
    }

    // ===== head parsing =====

    fn fail_head(&mut self, parse: Parse) {
        info!("client sent invalid request: {}", Error::new_parse(parse));
        let id = match self.flags.root {
            Some(id) => id,
            None => {
                self.close();
                return;
            }
        };
        self.read_timer.disarm();
        self.state = State::Running;
        self.engine().finalize(id, PhaseResult::Status(parse.status()));
    }

    /// Advances request-line or header parsing over the buffered bytes.
    /// Returns false when more input is needed.
    fn advance_head(&mut self) -> bool {
        let id = match self.flags.root {
            Some(id) => id,
            None => return false,
        };

        loop {
            match self.state {
                State::ReadingLine => {
                    let bufs = &mut self.io.read_bufs;
                    let mut pos = bufs.pos;
                    let res = parse::parse_request_line(bufs.active_buf(), &mut pos, &mut self.line_ctx);
                    bufs.pos = pos;
                    match res {
                        Ok(Status::Complete) => {
                            if let Err(p) = self.process_request_line(id) {
                                self.fail_head(p);
                                return true;
                            }
                            self.state = State::ReadingHeaders;
                            self.header_ctx =
                                HeaderCtx::new(self.server.options.underscores_in_headers);
                        }
                        Ok(Status::Again) => return false,
                        Err(p) => {
                            self.fail_head(p);
                            return true;
                        }
                    }
                }
                State::ReadingHeaders => {
                    let buf_id = self.io.read_bufs.active_id();
                    let bufs = &mut self.io.read_bufs;
                    let mut pos = bufs.pos;
                    let res = parse::parse_header_line(bufs.active_buf(), &mut pos, &mut self.header_ctx);
                    bufs.pos = pos;
                    match res {
                        Ok(HeaderStatus::Header) => {
                            if self.header_ctx.invalid {
                                if self.server.options.ignore_invalid_headers {
                                    debug!("client sent invalid header line, ignored");
                                    continue;
                                }
                                self.fail_head(Parse::HeaderName);
                                return true;
                            }
                            self.header_count += 1;
                            if self.header_count > MAX_HEADERS {
                                self.fail_head(Parse::TooLarge);
                                return true;
                            }
                            let name = self.header_ctx.name_span(buf_id);
                            let value = self.header_ctx.value_span(buf_id);
                            if let Err(p) = self.process_header(id, name, value) {
                                self.fail_head(p);
                                return true;
                            }
                        }
                        Ok(HeaderStatus::Done) => {
                            if let Err(p) = self.process_request(id) {
                                self.fail_head(p);
                            }
                            return true;
                        }
                        Ok(HeaderStatus::Again) => return false,
                        Err(p) => {
                            self.fail_head(p);
                            return true;
                        }
                    }
                }
                _ => return true,
            }
        }
    }

    fn process_request_line(&mut self, id: ReqId) -> std::result::Result<(), Parse> {
        let ctx = &self.line_ctx;
        let version = match (ctx.http_major, ctx.http_minor) {
            (1, 0) => Version::HTTP_10,
            // 1.x beyond 1.1 is treated as 1.1
            (1, _) => Version::HTTP_11,
            _ => return Err(Parse::Version),
        };

        let buf_id = self.io.read_bufs.active_id();
        let raw_span = Span::new(buf_id, ctx.uri_start, ctx.uri_end);
        let raw = self.io.read_bufs.slice(raw_span).to_vec();

        let (path, query, ext) = if ctx.empty_path {
            (b"/".to_vec(), Vec::new(), Vec::new())
        } else if ctx.complex_uri {
            let (path, query) = uri::normalize(&raw, self.server.options.merge_slashes)?;
            let ext = uri::extension(&path).to_vec();
            (path, query, ext)
        } else {
            let args_at = ctx.args_start.map(|a| (a - ctx.uri_start) as usize);
            let (p, q) = match args_at {
                Some(a) if a <= raw.len() => (raw[..a - 1].to_vec(), raw[a..].to_vec()),
                _ => (raw.clone(), Vec::new()),
            };
            let ext = uri::extension(&p).to_vec();
            (p, q, ext)
        };

        // an absolute-form target carries the authoritative host
        let host = match (ctx.host_start, ctx.host_end) {
            (Some(s), Some(e)) => {
                let span = Span::new(buf_id, s, e);
                Some(uri::validate_host(self.io.read_bufs.slice(span))?)
            }
            _ => None,
        };

        {
            let r = self.requests.get_mut(id).expect("request exists");
            r.method = ctx.method.clone();
            r.version = version;
            r.uri.path = Bytes::from(path);
            r.uri.query = Bytes::from(query);
            r.uri.ext = Bytes::from(ext);
            r.uri.raw = Bytes::from(raw);
            debug!(
                method = %r.method,
                uri = %String::from_utf8_lossy(&r.uri.path),
                version = ?version,
                "http request line parsed"
            );
        }

        if let Some(host) = host {
            self.requests
                .get_mut(id)
                .expect("request exists")
                .headers_in
                .server = Some(host.clone());
            self.engine()
                .set_virtual_server(id, &host)
                .map_err(|_| Parse::HostMismatch)?;
            self.sync_server(id);
        }

        Ok(())
    }

    fn process_header(
        &mut self,
        id: ReqId,
        name: Span,
        value: Span,
    ) -> std::result::Result<(), Parse> {
        let dispatched = {
            let r = self.requests.get_mut(id).expect("request exists");
            headers::dispatch(&mut r.headers_in, &self.io.read_bufs, name, value)?
        };
        if dispatched == Dispatched::Host {
            let host = self
                .requests
                .get(id)
                .and_then(|r| r.headers_in.server.clone())
                .expect("host just set");
            self.engine()
                .set_virtual_server(id, &host)
                .map_err(|_| Parse::HostMismatch)?;
            self.sync_server(id);
        }
        Ok(())
    }

    /// Mirrors the request's resolved server block on the connection, for
    /// timer and option lookups.
    fn sync_server(&mut self, id: ReqId) {
        if let Some(r) = self.requests.get(id) {
            if !Arc::ptr_eq(&self.server, &r.server) {
                self.server = r.server.clone();
            }
        }
    }

    /// The whole head is in: validate, then hand over to the phase
    /// pipeline.
    fn process_request(&mut self, id: ReqId) -> std::result::Result<(), Parse> {
        {
            let r = self.requests.get_mut(id).expect("request exists");
            let version = r.version;
            let method = r.method.clone();
            headers::process_request_header(&mut r.headers_in, &self.io.read_bufs, version, &method)?;
        }

        self.read_timer.disarm();
        self.state = State::Running;

        {
            let r = self.requests.get_mut(id).expect("request exists");
            r.header_only = r.method == Method::HEAD;
            r.keepalive = headers::wants_keepalive(&r.headers_in, r.version);
            let disable = r.server.options.keepalive_disable;
            let browser = r.headers_in.browser;
            if r.keepalive {
                if browser.msie6
                    && disable.msie6
                    && (r.method == Method::POST || r.method == Method::PUT)
                {
                    r.keepalive = false;
                } else if browser.safari && disable.safari {
                    r.keepalive = false;
                }
            }
        }

        self.engine().prepare_body(id);

        let expect = {
            let r = self.requests.get(id).expect("request exists");
            r.headers_in
                .expect_continue(&self.io.read_bufs, r.version)
        };
        if let Some(r) = self.requests.get_mut(id) {
            r.expect_continue = expect && r.body.is_some();
        }

        if self.ssl && !self.tls_established {
            info!("client sent plain HTTP request to HTTPS port");
            self.engine()
                .finalize(id, PhaseResult::Status(StatusCode::BAD_REQUEST));
            return Ok(());
        }

        debug!("http process request");
        self.invoke_phases(id);
        Ok(())
    }

    fn invoke_phases(&mut self, id: ReqId) {
        if let Some(r) = self.requests.get_mut(id) {
            r.write_state = WriteState::Phases;
        }
        self.invoke(id);
    }

    // ===== read-side pumps =====

    /// Feeds the discard drain and handler body reads. Returns true if the
    /// caller should keep looping.
    fn pump_body(&mut self, cx: &mut Context<'_>) -> Result<bool> {
        let root = match self.flags.root {
            Some(id) => id,
            None => return Ok(false),
        };
        let read_state = match self.requests.get(root) {
            Some(r) => r.read_state,
            None => return Ok(false),
        };

        match read_state {
            ReadState::DiscardBody => {
                // consume any tail already in the header buffers
                loop {
                    let done = {
                        let tail = self.io.read_bufs.unparsed().to_vec();
                        let r = self.requests.get_mut(root).expect("root exists");
                        let d = match r.body {
                            Some(ref mut d) if !d.is_eof() => d,
                            _ => {
                                r.discard_body = false;
                                r.read_state = ReadState::Test;
                                return Ok(true);
                            }
                        };
                        if !tail.is_empty() {
                            let consumed =
                                d.drain(&tail).map_err(|p| Error::new_parse(p))?;
                            self.io.read_bufs.pos += consumed;
                        }
                        d.is_eof()
                    };
                    if done {
                        let r = self.requests.get_mut(root).expect("root exists");
                        r.discard_body = false;
                        r.read_state = ReadState::Test;
                        return Ok(true);
                    }

                    let mut scratch = [0u8; DISCARD_BUFFER_SIZE];
                    match self.io.poll_read_discard(cx, &mut scratch) {
                        Poll::Pending => {
                            if self.flags.discard_drain {
                                self.read_timer
                                    .arm_if_unset(self.server.options.lingering_timeout);
                            }
                            return Ok(false);
                        }
                        Poll::Ready(Ok(0)) => {
                            debug!("client closed while body was being discarded");
                            self.flags.error = true;
                            self.fatal = Some(Error::new_peer_closed());
                            self.engine().terminate(root, None);
                            return Ok(true);
                        }
                        Poll::Ready(Ok(n)) => {
                            let r = self.requests.get_mut(root).expect("root exists");
                            if let Some(ref mut d) = r.body {
                                d.drain(&scratch[..n]).map_err(|p| Error::new_parse(p))?;
                            }
                        }
                        Poll::Ready(Err(e)) => {
                            self.flags.error = true;
                            self.engine().terminate(root, None);
                            return Err(Error::new_io(e));
                        }
                    }
                }
            }
            ReadState::Body => {
                let buffered = !self.io.read_bufs.unparsed().is_empty()
                    || !self.flags.body_buf.is_empty();
                if buffered {
                    return Ok(false);
                }
                let mut scratch = [0u8; DISCARD_BUFFER_SIZE];
                match self.io.poll_read_discard(cx, &mut scratch) {
                    Poll::Pending => Ok(false),
                    Poll::Ready(Ok(0)) => {
                        debug!("client closed mid-body");
                        self.flags.error = true;
                        self.fatal = Some(Error::new_peer_closed());
                        self.engine().terminate(root, None);
                        Ok(true)
                    }
                    Poll::Ready(Ok(n)) => {
                        self.flags.body_buf.extend_from_slice(&scratch[..n]);
                        // wake the handler with the new bytes
                        self.invoke_phases(root);
                        Ok(true)
                    }
                    Poll::Ready(Err(e)) => {
                        self.flags.error = true;
                        self.engine().terminate(root, None);
                        Err(Error::new_io(e))
                    }
                }
            }
            _ => Ok(false),
        }
    }

    // ===== state transitions =====

    fn enter_keepalive(&mut self) {
        self.requests_served += 1;
        self.write_timer.disarm();
        self.read_timer.disarm();
        self.delayed = false;

        let leftover = !self.io.read_bufs.unparsed().is_empty();
        self.io.read_bufs.recycle(leftover);

        if leftover {
            debug!("pipelined request");
            self.create_request(true);
            self.read_timer.arm(self.server.options.client_header_timeout);
            self.state = State::ReadingLine;
            return;
        }

        self.io.read_bufs.release_input_if_empty();
        // with tcp_nopush the kernel cork already batched the response;
        // everything was flushed before getting here, so nothing is owed
        if self.server.options.tcp_nodelay && !self.server.options.tcp_nopush {
            if let Err(e) = self.io.transport().set_nodelay(true) {
                debug!("set_nodelay failed: {}", e);
            }
        }
        self.read_timer.arm(self.server.options.keepalive_timeout);
        debug!("set http keepalive handler");
        self.state = State::Keepalive;
    }

    fn enter_lingering(&mut self) {
        let opts = &self.server.options;
        self.lingering_deadline = Some(Instant::now() + opts.lingering_time);
        self.read_timer.arm(opts.lingering_timeout);
        self.write_timer.disarm();
        self.shutdown_done = false;
        debug!("http lingering close handler");
        self.state = State::Lingering;
    }

    fn poll_lingering(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.shutdown_done {
            match self.io.poll_shutdown_write(cx) {
                Poll::Ready(Ok(())) => self.shutdown_done = true,
                Poll::Ready(Err(e)) => {
                    debug!("shutdown() failed during lingering close: {}", e);
                    self.fatal = Some(Error::new_shutdown(e));
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        if self.read_timer.poll_expired(cx) {
            return Poll::Ready(());
        }
        let deadline = self.lingering_deadline.expect("deadline set on entry");

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => return Poll::Ready(()),
            };
            let mut scratch = [0u8; DISCARD_BUFFER_SIZE];
            match self.io.poll_read_discard(cx, &mut scratch) {
                Poll::Pending => {
                    let timeout = remaining.min(self.server.options.lingering_timeout);
                    self.read_timer.arm_if_unset(timeout);
                    return Poll::Pending;
                }
                Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) => return Poll::Ready(()),
                Poll::Ready(Ok(n)) => {
                    trace!("lingering read: {}", n);
                    // fresh per-read budget now that bytes arrived
                    self.read_timer.disarm();
                }
            }
        }
    }
}

impl<T, P> Future for Connection<T, P>
where
    T: Transport + Unpin,
    P: Phases + Unpin,
{
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            this.drain_logs();

            if let Some(d) = this.flags.disposition.take() {
                match d {
                    Disposition::Close => this.close(),
                    Disposition::Keepalive => this.enter_keepalive(),
                    Disposition::Lingering => this.enter_lingering(),
                }
                continue;
            }

            match this.state {
                State::Closed => {
                    this.drain_logs();
                    return Poll::Ready(match this.fatal.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    });
                }

                State::WaitRequest => {
                    // post_accept timeout until the first byte
                    this.read_timer
                        .arm_if_unset(this.server.options.client_header_timeout);
                    if this.read_timer.poll_expired(cx) {
                        info!("client timed out before sending a request");
                        this.flags.timedout = true;
                        this.close();
                        continue;
                    }
                    if this.io.read_bufs.unparsed().is_empty() {
                        match this.io.poll_read_head(cx) {
                            Poll::Pending => {
                                // shed the buffer while the connection idles
                                this.io.read_bufs.release_input_if_empty();
                                return Poll::Pending;
                            }
                            Poll::Ready(Ok(0)) => {
                                info!("client closed connection before sending a request");
                                this.close();
                                continue;
                            }
                            Poll::Ready(Ok(_)) => {}
                            Poll::Ready(Err(e)) => {
                                this.fatal = Some(Error::new_io(e));
                                this.close();
                                continue;
                            }
                        }
                    }
                    if this.proxy_pending {
                        let parsed = {
                            let buf = this.io.read_bufs.unparsed().to_vec();
                            intake::parse_proxy_v1(&buf)
                        };
                        match parsed {
                            Ok(None) => {
                                // incomplete prefix; read more
                                match this.io.poll_read_head(cx) {
                                    Poll::Pending => return Poll::Pending,
                                    Poll::Ready(Ok(0)) => {
                                        info!("client closed inside PROXY protocol header");
                                        this.close();
                                    }
                                    Poll::Ready(Ok(_)) => {}
                                    Poll::Ready(Err(e)) => {
                                        this.fatal = Some(Error::new_io(e));
                                        this.close();
                                    }
                                }
                                continue;
                            }
                            Ok(Some((addrs, consumed))) => {
                                this.proxy_pending = false;
                                this.flags.proxied = addrs;
                                this.io.read_bufs.pos += consumed;
                                debug!("PROXY protocol prefix consumed");
                            }
                            Err(p) => {
                                info!("broken PROXY protocol header");
                                this.fatal = Some(Error::new_parse(p));
                                this.close();
                                continue;
                            }
                        }
                    }
                    if this.io.read_bufs.unparsed().is_empty() {
                        continue;
                    }
                    this.create_request(false);
                    this.state = State::ReadingLine;
                }

                State::ReadingLine | State::ReadingHeaders => {
                    if this.advance_head() {
                        continue;
                    }
                    // need more bytes; make room first
                    if this.io.read_bufs.active_spare() == 0 {
                        let (at_start, token) = match this.state {
                            State::ReadingLine => (
                                this.line_ctx.at_start(),
                                this.line_ctx.token_start(),
                            ),
                            _ => (
                                this.header_ctx.at_start(),
                                this.header_ctx.token_start(),
                            ),
                        };
                        let arg = if at_start {
                            if this.state == State::ReadingLine {
                                None
                            } else {
                                Some(this.io.read_bufs.pos)
                            }
                        } else {
                            Some(token)
                        };
                        match this.io.read_bufs.grow(arg) {
                            Grow::Moved => {
                                if let Some(moved) = arg {
                                    if !at_start {
                                        match this.state {
                                            State::ReadingLine => {
                                                this.line_ctx.relocate(moved as u32)
                                            }
                                            _ => this.header_ctx.relocate(moved as u32),
                                        }
                                    }
                                }
                                continue;
                            }
                            Grow::Exhausted => {
                                let p = if this.state == State::ReadingLine {
                                    Parse::UriTooLong
                                } else {
                                    Parse::TooLarge
                                };
                                this.fail_head(p);
                                continue;
                            }
                        }
                    }
                    if this.read_timer.poll_expired(cx) {
                        info!("client timed out while sending the request head");
                        this.flags.timedout = true;
                        this.fatal = Some(Error::new_header_timeout());
                        if let Some(id) = this.flags.root {
                            this.engine()
                                .terminate(id, Some(StatusCode::REQUEST_TIMEOUT));
                        }
                        continue;
                    }
                    match this.io.poll_read_head(cx) {
                        Poll::Pending => {
                            this.read_timer
                                .arm_if_unset(this.server.options.client_header_timeout);
                            return Poll::Pending;
                        }
                        Poll::Ready(Ok(0)) => {
                            info!("client prematurely closed connection");
                            this.flags.error = true;
                            this.fatal = Some(Error::new_incomplete());
                            if let Some(id) = this.flags.root {
                                this.engine().terminate(id, None);
                            } else {
                                this.close();
                            }
                            continue;
                        }
                        Poll::Ready(Ok(_)) => continue,
                        Poll::Ready(Err(e)) => {
                            this.flags.error = true;
                            this.fatal = Some(Error::new_io(e));
                            if let Some(id) = this.flags.root {
                                this.engine().terminate(id, None);
                            } else {
                                this.close();
                            }
                            continue;
                        }
                    }
                }

                State::Running => {
                    // posted requests run before anything else
                    let next = this.engine().take_posted();
                    if let Some(rid) = next {
                        this.invoke(rid);
                        continue;
                    }

                    // write-side timeout or throttle release
                    if this.write_timer.poll_expired(cx) {
                        if this.delayed {
                            this.delayed = false;
                        } else if !this.io.write_buf.is_empty() {
                            info!("client timed out while reading the response");
                            this.flags.timedout = true;
                            this.fatal = Some(Error::new_send_timeout());
                            if let Some(id) = this.flags.current_writer.or(this.flags.root) {
                                this.engine()
                                    .finalize(id, PhaseResult::Status(StatusCode::REQUEST_TIMEOUT));
                            }
                            continue;
                        }
                    }

                    if this.delayed {
                        return Poll::Pending;
                    }

                    if !this.io.write_buf.is_empty() {
                        let allow = this.rate_allowance();
                        if allow == 0 {
                            this.arm_rate_delay();
                            continue;
                        }
                        match this.io.poll_flush(cx, allow) {
                            Poll::Pending => {
                                this.write_timer
                                    .arm_if_unset(this.server.options.send_timeout);
                                return Poll::Pending;
                            }
                            Poll::Ready(Ok(())) => {
                                if !this.io.write_buf.is_empty() {
                                    // ran out of allowance mid-buffer
                                    this.arm_rate_delay();
                                    continue;
                                }
                            }
                            Poll::Ready(Err(e)) => {
                                debug!("transport write error: {}", e);
                                this.flags.error = true;
                                this.fatal = Some(Error::new_io(e));
                                if let Some(id) = this.flags.root {
                                    this.engine().terminate(id, None);
                                } else {
                                    this.close();
                                }
                                continue;
                            }
                        }
                    }

                    // everything flushed: give the writer its turn
                    this.write_timer.disarm();
                    let writer = this
                        .flags
                        .current_writer
                        .filter(|id| {
                            this.requests
                                .get(*id)
                                .map(|r| r.write_state == WriteState::Writer)
                                .unwrap_or(false)
                        });
                    if let Some(id) = writer {
                        this.invoke(id);
                        continue;
                    }

                    // only once the response bytes are out does the read
                    // side get to drain or deliver body bytes
                    match this.pump_body(cx) {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(e) => {
                            this.fatal = Some(e);
                            this.close();
                            continue;
                        }
                    }

                    if this.requests.is_empty() && this.flags.disposition.is_none() {
                        // tree fully settled without an explicit verdict
                        this.close();
                        continue;
                    }

                    return Poll::Pending;
                }

                State::Keepalive => {
                    if this.read_timer.poll_expired(cx) {
                        debug!("http keepalive timeout");
                        this.close();
                        continue;
                    }
                    match this.io.poll_read_head(cx) {
                        Poll::Pending => {
                            this.io.read_bufs.release_input_if_empty();
                            return Poll::Pending;
                        }
                        Poll::Ready(Ok(0)) => {
                            info!("client closed keepalive connection");
                            this.close();
                            continue;
                        }
                        Poll::Ready(Ok(_)) => {
                            this.read_timer.disarm();
                            this.create_request(false);
                            this.read_timer
                                .arm(this.server.options.client_header_timeout);
                            this.state = State::ReadingLine;
                        }
                        Poll::Ready(Err(e)) => {
                            this.fatal = Some(Error::new_io(e));
                            this.close();
                            continue;
                        }
                    }
                }

                State::Lingering => match this.poll_lingering(cx) {
                    Poll::Ready(()) => {
                        if let Some(id) = this.flags.root {
                            this.engine().close_request(id);
                        } else {
                            this.close();
                        }
                        continue;
                    }
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }
}

