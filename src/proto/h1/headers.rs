//! Known-header dispatch and post-parse validation.
//!
//! After each header line completes, the dispatcher lowercases the name
//! into a stack buffer and looks it up in a static table. Known headers
//! land in typed `HeadersIn` fields; everything is also kept in declaration
//! order for pass-through.

use http::{Method, Version};
use tracing::debug;

use crate::common::contains_token;
use crate::error::Parse;

use super::buffer::{HeaderBuffers, Span};
use super::uri::validate_host;

const LC_HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderLine {
    pub name: Span,
    pub value: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionType {
    Default,
    Close,
    KeepAlive,
}

/// Coarse browser-family flags from `User-Agent`, recorded for modules
/// that need compatibility quirks.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserFlags {
    pub msie: bool,
    pub msie6: bool,
    pub opera: bool,
    pub gecko: bool,
    pub chrome: bool,
    pub safari: bool,
}

/// Parsed request headers with typed accessors for the ones the engine
/// itself consumes. Indexes point into `lines`.
pub(crate) struct HeadersIn {
    pub lines: Vec<HeaderLine>,
    pub host: Option<usize>,
    pub user_agent: Option<usize>,
    pub content_length: Option<usize>,
    pub transfer_encoding: Option<usize>,
    pub expect: Option<usize>,
    pub if_modified_since: Option<usize>,
    pub authorization: Option<usize>,
    pub cookies: Vec<usize>,
    pub x_forwarded_for: Vec<usize>,

    pub content_length_n: Option<u64>,
    pub chunked: bool,
    pub connection_type: ConnectionType,
    /// Validated, lowercased `Host` value.
    pub server: Option<String>,
    pub browser: BrowserFlags,
}

impl HeadersIn {
    pub(crate) fn new() -> HeadersIn {
        HeadersIn {
            lines: Vec::new(),
            host: None,
            user_agent: None,
            content_length: None,
            transfer_encoding: None,
            expect: None,
            if_modified_since: None,
            authorization: None,
            cookies: Vec::new(),
            x_forwarded_for: Vec::new(),
            content_length_n: None,
            chunked: false,
            connection_type: ConnectionType::Default,
            server: None,
            browser: BrowserFlags::default(),
        }
    }

    pub(crate) fn expect_continue(&self, bufs: &HeaderBuffers, version: Version) -> bool {
        if version < Version::HTTP_11 {
            return false;
        }
        match self.expect {
            Some(i) => {
                let v = bufs.slice(self.lines[i].value);
                v.eq_ignore_ascii_case(b"100-continue")
            }
            None => false,
        }
    }
}

enum Kind {
    Plain(fn(&mut HeadersIn, usize)),
    Unique(fn(&mut HeadersIn, usize) -> bool),
    Multi(fn(&mut HeadersIn, usize)),
    Special(Special),
}

#[derive(Clone, Copy)]
enum Special {
    Host,
    Connection,
    UserAgent,
}

static TABLE: &[(&str, Kind)] = &[
    ("host", Kind::Special(Special::Host)),
    ("connection", Kind::Special(Special::Connection)),
    ("user-agent", Kind::Special(Special::UserAgent)),
    ("content-length", Kind::Unique(|h, i| {
        if h.content_length.is_some() {
            return false;
        }
        h.content_length = Some(i);
        true
    })),
    ("if-modified-since", Kind::Unique(|h, i| {
        if h.if_modified_since.is_some() {
            return false;
        }
        h.if_modified_since = Some(i);
        true
    })),
    ("authorization", Kind::Unique(|h, i| {
        if h.authorization.is_some() {
            return false;
        }
        h.authorization = Some(i);
        true
    })),
    ("transfer-encoding", Kind::Plain(|h, i| h.transfer_encoding = Some(i))),
    ("expect", Kind::Plain(|h, i| h.expect = Some(i))),
    ("cookie", Kind::Multi(|h, i| h.cookies.push(i))),
    ("x-forwarded-for", Kind::Multi(|h, i| h.x_forwarded_for.push(i))),
];

/// What a dispatched header changed, when the caller has follow-up work.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatched {
    None,
    /// A `Host` header was accepted; the virtual server may need
    /// re-resolution.
    Host,
}

/// Files one parsed header line into `headers_in`.
pub(crate) fn dispatch(
    hin: &mut HeadersIn,
    bufs: &HeaderBuffers,
    name: Span,
    value: Span,
) -> Result<Dispatched, Parse> {
    let idx = hin.lines.len();
    hin.lines.push(HeaderLine { name, value });

    let name_bytes = bufs.slice(name);
    if name_bytes.len() > LC_HEADER_LEN {
        return Ok(Dispatched::None);
    }
    let mut lc = [0u8; LC_HEADER_LEN];
    for (d, s) in lc.iter_mut().zip(name_bytes) {
        *d = s.to_ascii_lowercase();
    }
    let lc = &lc[..name_bytes.len()];

    for (tname, kind) in TABLE {
        if tname.as_bytes() != lc {
            continue;
        }
        match kind {
            Kind::Plain(set) => set(hin, idx),
            Kind::Unique(set) => {
                if !set(hin, idx) {
                    debug!("client sent duplicate header line: {:?}", tname);
                    return Err(Parse::Header);
                }
            }
            Kind::Multi(push) => push(hin, idx),
            Kind::Special(s) => return special(hin, bufs, *s, idx),
        }
        return Ok(Dispatched::None);
    }
    Ok(Dispatched::None)
}

fn special(
    hin: &mut HeadersIn,
    bufs: &HeaderBuffers,
    which: Special,
    idx: usize,
) -> Result<Dispatched, Parse> {
    match which {
        Special::Host => {
            if hin.host.is_some() {
                debug!("client sent duplicate Host header");
                return Err(Parse::Header);
            }
            let host = validate_host(bufs.slice(hin.lines[idx].value))?;
            hin.host = Some(idx);
            // the request line's absolute-form host wins
            if hin.server.is_none() {
                hin.server = Some(host);
                return Ok(Dispatched::Host);
            }
            Ok(Dispatched::None)
        }
        Special::Connection => {
            let v = bufs.slice(hin.lines[idx].value);
            if contains_token(v, b"close") {
                hin.connection_type = ConnectionType::Close;
            } else if contains_token(v, b"keep-alive") {
                hin.connection_type = ConnectionType::KeepAlive;
            }
            Ok(Dispatched::None)
        }
        Special::UserAgent => {
            hin.user_agent = Some(idx);
            let v = bufs.slice(hin.lines[idx].value);
            let b = &mut hin.browser;
            if contains_token(v, b"Opera") {
                b.opera = true;
            } else if contains_token(v, b"MSIE") {
                b.msie = true;
                b.msie6 = (contains_token(v, b"MSIE 5") || contains_token(v, b"MSIE 6"))
                    && !contains_token(v, b"SV1");
            } else if contains_token(v, b"Chrome/") {
                b.chrome = true;
            } else if contains_token(v, b"Safari/") {
                b.safari = true;
            } else if contains_token(v, b"Gecko/") {
                b.gecko = true;
            }
            Ok(Dispatched::None)
        }
    }
}

fn parse_content_length(value: &[u8]) -> Result<u64, Parse> {
    if value.is_empty() {
        return Err(Parse::ContentLength);
    }
    let mut n: u64 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(Parse::ContentLength);
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add((b - b'0') as u64))
            .ok_or(Parse::ContentLength)?;
    }
    Ok(n)
}

/// Validation that runs once the whole header block is in, mirroring the
/// order the checks apply on a live connection.
pub(crate) fn process_request_header(
    hin: &mut HeadersIn,
    bufs: &HeaderBuffers,
    version: Version,
    method: &Method,
) -> Result<(), Parse> {
    if version >= Version::HTTP_11 && hin.server.is_none() {
        debug!("client sent HTTP/1.1 request without \"Host\" header");
        return Err(Parse::HostMissing);
    }

    if let Some(i) = hin.content_length {
        let n = parse_content_length(bufs.slice(hin.lines[i].value))?;
        hin.content_length_n = Some(n);
    }

    if *method == Method::TRACE {
        debug!("client sent TRACE method");
        return Err(Parse::MethodNotAllowed);
    }

    if let Some(i) = hin.transfer_encoding {
        let v = bufs.slice(hin.lines[i].value);
        if v.eq_ignore_ascii_case(b"chunked") {
            if version < Version::HTTP_11 {
                debug!("client sent HTTP/1.0 request with Transfer-Encoding");
                return Err(Parse::Header);
            }
            // chunked framing wins over any Content-Length
            hin.content_length = None;
            hin.content_length_n = None;
            hin.chunked = true;
        } else if !v.eq_ignore_ascii_case(b"identity") {
            debug!("client sent unknown \"Transfer-Encoding\"");
            return Err(Parse::TransferEncoding);
        }
    }

    Ok(())
}

/// Whether the protocol defaults plus any `Connection` header permit
/// reusing this connection.
pub(crate) fn wants_keepalive(hin: &HeadersIn, version: Version) -> bool {
    match hin.connection_type {
        ConnectionType::Close => false,
        ConnectionType::KeepAlive => true,
        ConnectionType::Default => version >= Version::HTTP_11,
    }
}
