//! Incremental request-line and header-line parser.
//!
//! The parser is a byte-at-a-time state machine: it never requires a whole
//! production to arrive in one read, and it writes nothing. Output is a set
//! of marks (offsets into the active header buffer) that the caller turns
//! into [`Span`]s; when the buffer grows mid-token, [`RequestLineCtx::relocate`]
//! and [`HeaderCtx::relocate`] shift the in-flight marks.

use http::Method;

use crate::error::Parse;

use super::buffer::Span;

/// One parser step either finished a production or wants more bytes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Complete,
    Again,
}

/// Header-line parsing has one more terminal: the blank line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HeaderStatus {
    /// One `name: value` line completed; marks are in the context.
    Header,
    /// The blank line ended the header block.
    Done,
    Again,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Start,
    Method,
    SpacesBeforeUri,
    Schema,
    SchemaSlash,
    SchemaSlashSlash,
    HostStart,
    Host,
    HostIpLiteral,
    HostEnd,
    Port,
    AfterSlashInUri,
    CheckUri,
    Uri,
    Http09,
    HttpH,
    HttpHT,
    HttpHTT,
    HttpHTTP,
    FirstMajorDigit,
    MajorDigit,
    FirstMinorDigit,
    MinorDigit,
    SpacesAfterDigit,
    AlmostDone,
}

/// In-progress request-line parse. All `*_start`/`*_end` fields are offsets
/// into the active header buffer.
#[derive(Debug)]
pub(crate) struct RequestLineCtx {
    state: LineState,
    pub method: Method,
    pub request_start: u32,
    pub method_end: u32,
    pub uri_start: u32,
    pub uri_end: u32,
    pub schema_start: Option<u32>,
    pub schema_end: Option<u32>,
    pub host_start: Option<u32>,
    pub host_end: Option<u32>,
    pub port_start: Option<u32>,
    pub port_end: Option<u32>,
    pub args_start: Option<u32>,
    pub uri_ext: Option<u32>,
    pub request_end: u32,
    pub http_major: u8,
    pub http_minor: u8,
    /// URI needs the normalization pass (`%`, `//`, dot segments, `#`).
    pub complex_uri: bool,
    pub quoted_uri: bool,
    pub plus_in_uri: bool,
    /// Absolute-form URI with no path component.
    pub empty_path: bool,
}

impl Default for RequestLineCtx {
    fn default() -> Self {
        RequestLineCtx {
            state: LineState::Start,
            method: Method::GET,
            request_start: 0,
            method_end: 0,
            uri_start: 0,
            uri_end: 0,
            schema_start: None,
            schema_end: None,
            host_start: None,
            host_end: None,
            port_start: None,
            port_end: None,
            args_start: None,
            uri_ext: None,
            request_end: 0,
            http_major: 0,
            http_minor: 0,
            complex_uri: false,
            quoted_uri: false,
            plus_in_uri: false,
            empty_path: false,
        }
    }
}

impl RequestLineCtx {
    /// True while no byte of the request line has been consumed yet; the
    /// buffer may be reset in place instead of grown.
    pub(crate) fn at_start(&self) -> bool {
        self.state == LineState::Start
    }

    /// Offset the unterminated tail begins at, for buffer relocation.
    pub(crate) fn token_start(&self) -> usize {
        self.request_start as usize
    }

    /// Shift every live mark after the tail moved to the front of a fresh
    /// buffer.
    pub(crate) fn relocate(&mut self, moved: u32) {
        self.request_start -= moved;
        for m in [
            &mut self.method_end,
            &mut self.uri_start,
            &mut self.uri_end,
            &mut self.request_end,
        ] {
            if *m >= moved {
                *m -= moved;
            } else {
                *m = 0;
            }
        }
        for m in [
            &mut self.schema_start,
            &mut self.schema_end,
            &mut self.host_start,
            &mut self.host_end,
            &mut self.port_start,
            &mut self.port_end,
            &mut self.args_start,
            &mut self.uri_ext,
        ]
        .iter_mut()
        {
            if let Some(v) = m.as_mut() {
                *v -= moved;
            }
        }
    }
}

fn is_method_byte(b: u8) -> bool {
    (b'A'..=b'Z').contains(&b) || b == b'_' || b == b'-'
}

fn resolve_method(token: &[u8]) -> Result<Method, Parse> {
    match token {
        b"GET" => Ok(Method::GET),
        b"HEAD" => Ok(Method::HEAD),
        b"POST" => Ok(Method::POST),
        b"PUT" => Ok(Method::PUT),
        b"DELETE" => Ok(Method::DELETE),
        b"OPTIONS" => Ok(Method::OPTIONS),
        b"TRACE" => Ok(Method::TRACE),
        b"PATCH" => Ok(Method::PATCH),
        _ => Method::from_bytes(token).map_err(|_| Parse::Method),
    }
}

/// Advances the request-line machine over `buf[*pos..]`.
///
/// On `Ok(Complete)` every mark in `ctx` is final and `*pos` sits one byte
/// past the line terminator.
pub(crate) fn parse_request_line(
    buf: &[u8],
    pos: &mut usize,
    ctx: &mut RequestLineCtx,
) -> Result<Status, Parse> {
    use self::LineState::*;

    let mut p = *pos;
    let mut state = ctx.state;

    macro_rules! suspend {
        () => {{
            ctx.state = state;
            *pos = p;
            return Ok(Status::Again);
        }};
    }

    while p < buf.len() {
        let ch = buf[p];
        match state {
            Start => match ch {
                b'\r' | b'\n' => {}
                _ if is_method_byte(ch) => {
                    ctx.request_start = p as u32;
                    state = Method;
                }
                _ => return Err(Parse::Method),
            },
            Method => match ch {
                b' ' => {
                    ctx.method_end = p as u32;
                    let token = &buf[ctx.request_start as usize..p];
                    ctx.method = resolve_method(token)?;
                    state = SpacesBeforeUri;
                }
                _ if is_method_byte(ch) => {}
                _ => return Err(Parse::Method),
            },
            SpacesBeforeUri => match ch {
                b'/' => {
                    ctx.uri_start = p as u32;
                    state = AfterSlashInUri;
                }
                b' ' => {}
                c if c.is_ascii_alphabetic() => {
                    ctx.schema_start = Some(p as u32);
                    state = Schema;
                }
                _ => return Err(Parse::Uri),
            },
            Schema => match ch {
                b':' => {
                    ctx.schema_end = Some(p as u32);
                    state = SchemaSlash;
                }
                c if c.is_ascii_alphanumeric() || c == b'+' || c == b'-' || c == b'.' => {}
                _ => return Err(Parse::Uri),
            },
            SchemaSlash => match ch {
                b'/' => state = SchemaSlashSlash,
                _ => return Err(Parse::Uri),
            },
            SchemaSlashSlash => match ch {
                b'/' => state = HostStart,
                _ => return Err(Parse::Uri),
            },
            HostStart => {
                ctx.host_start = Some(p as u32);
                if ch == b'[' {
                    state = HostIpLiteral;
                } else {
                    state = Host;
                    continue;
                }
            }
            Host => match ch {
                c if c.is_ascii_alphanumeric() || c == b'.' || c == b'-' => {}
                _ => {
                    ctx.host_end = Some(p as u32);
                    state = HostEnd;
                    continue;
                }
            },
            HostIpLiteral => match ch {
                b']' => {
                    ctx.host_end = Some(p as u32 + 1);
                    state = HostEnd;
                }
                c if c.is_ascii_hexdigit() || c == b':' || c == b'.' => {}
                _ => return Err(Parse::Uri),
            },
            HostEnd => match ch {
                b':' => {
                    ctx.port_start = Some(p as u32 + 1);
                    state = Port;
                }
                b'/' => {
                    ctx.uri_start = p as u32;
                    state = AfterSlashInUri;
                }
                b' ' => {
                    ctx.empty_path = true;
                    ctx.uri_start = p as u32;
                    ctx.uri_end = p as u32;
                    state = Http09;
                }
                _ => return Err(Parse::Uri),
            },
            Port => match ch {
                c if c.is_ascii_digit() => {}
                b'/' => {
                    ctx.port_end = Some(p as u32);
                    ctx.uri_start = p as u32;
                    state = AfterSlashInUri;
                }
                b' ' => {
                    ctx.port_end = Some(p as u32);
                    ctx.empty_path = true;
                    ctx.uri_start = p as u32;
                    ctx.uri_end = p as u32;
                    state = Http09;
                }
                _ => return Err(Parse::Uri),
            },
            AfterSlashInUri => match ch {
                b' ' => {
                    ctx.uri_end = p as u32;
                    state = Http09;
                }
                b'\r' | b'\n' => return Err(Parse::Version),
                b'.' | b'%' | b'/' | b'#' => {
                    ctx.complex_uri = true;
                    if ch == b'%' {
                        ctx.quoted_uri = true;
                    }
                    state = Uri;
                }
                b'?' => {
                    ctx.args_start = Some(p as u32 + 1);
                    state = Uri;
                }
                b'+' => {
                    ctx.plus_in_uri = true;
                    state = CheckUri;
                }
                0 => return Err(Parse::Uri),
                _ => state = CheckUri,
            },
            CheckUri => match ch {
                b'/' => {
                    ctx.uri_ext = None;
                    state = AfterSlashInUri;
                }
                b'.' => {
                    ctx.uri_ext = Some(p as u32 + 1);
                }
                b' ' => {
                    ctx.uri_end = p as u32;
                    state = Http09;
                }
                b'\r' | b'\n' => return Err(Parse::Version),
                b'%' => {
                    ctx.complex_uri = true;
                    ctx.quoted_uri = true;
                    state = Uri;
                }
                b'?' => {
                    ctx.args_start = Some(p as u32 + 1);
                    state = Uri;
                }
                b'#' => {
                    ctx.complex_uri = true;
                    state = Uri;
                }
                b'+' => {
                    ctx.plus_in_uri = true;
                }
                0 => return Err(Parse::Uri),
                _ => {}
            },
            Uri => match ch {
                b' ' => {
                    ctx.uri_end = p as u32;
                    state = Http09;
                }
                b'\r' | b'\n' => return Err(Parse::Version),
                b'#' => ctx.complex_uri = true,
                0 => return Err(Parse::Uri),
                _ => {}
            },
            Http09 => match ch {
                b' ' => {}
                b'H' => state = HttpH,
                _ => return Err(Parse::Version),
            },
            HttpH => match ch {
                b'T' => state = HttpHT,
                _ => return Err(Parse::Version),
            },
            HttpHT => match ch {
                b'T' => state = HttpHTT,
                _ => return Err(Parse::Version),
            },
            HttpHTT => match ch {
                b'P' => state = HttpHTTP,
                _ => return Err(Parse::Version),
            },
            HttpHTTP => match ch {
                b'/' => state = FirstMajorDigit,
                _ => return Err(Parse::Version),
            },
            FirstMajorDigit => match ch {
                b'1'..=b'9' => {
                    ctx.http_major = ch - b'0';
                    state = MajorDigit;
                }
                _ => return Err(Parse::Version),
            },
            MajorDigit => match ch {
                b'.' => state = FirstMinorDigit,
                c if c.is_ascii_digit() => {
                    if ctx.http_major > 9 {
                        return Err(Parse::Version);
                    }
                    ctx.http_major = ctx.http_major * 10 + (c - b'0');
                }
                _ => return Err(Parse::Version),
            },
            FirstMinorDigit => match ch {
                c if c.is_ascii_digit() => {
                    ctx.http_minor = c - b'0';
                    state = MinorDigit;
                }
                _ => return Err(Parse::Version),
            },
            MinorDigit => match ch {
                b'\r' => {
                    ctx.request_end = p as u32;
                    state = AlmostDone;
                }
                b'\n' => {
                    ctx.request_end = p as u32;
                    *pos = p + 1;
                    ctx.state = Start;
                    return Ok(Status::Complete);
                }
                b' ' => {
                    ctx.request_end = p as u32;
                    state = SpacesAfterDigit;
                }
                c if c.is_ascii_digit() => {
                    if ctx.http_minor > 9 {
                        return Err(Parse::Version);
                    }
                    ctx.http_minor = ctx.http_minor * 10 + (c - b'0');
                }
                _ => return Err(Parse::Version),
            },
            SpacesAfterDigit => match ch {
                b' ' => {}
                b'\r' => state = AlmostDone,
                b'\n' => {
                    *pos = p + 1;
                    ctx.state = Start;
                    return Ok(Status::Complete);
                }
                _ => return Err(Parse::Version),
            },
            AlmostDone => match ch {
                b'\n' => {
                    *pos = p + 1;
                    ctx.state = Start;
                    return Ok(Status::Complete);
                }
                _ => return Err(Parse::Uri),
            },
        }
        p += 1;
    }
    suspend!()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Start,
    Name,
    SpaceBeforeValue,
    Value,
    SpaceAfterValue,
    AlmostDone,
    HeaderAlmostDone,
}

/// In-progress header-line parse.
#[derive(Debug)]
pub(crate) struct HeaderCtx {
    state: HeaderState,
    pub header_name_start: u32,
    pub header_name_end: u32,
    pub header_start: u32,
    pub header_end: u32,
    /// The line was malformed but recoverable (bad name byte, missing
    /// colon); the caller decides between skipping and rejecting.
    pub invalid: bool,
    pub allow_underscores: bool,
}

impl HeaderCtx {
    pub(crate) fn new(allow_underscores: bool) -> HeaderCtx {
        HeaderCtx {
            state: HeaderState::Start,
            header_name_start: 0,
            header_name_end: 0,
            header_start: 0,
            header_end: 0,
            invalid: false,
            allow_underscores,
        }
    }

    pub(crate) fn at_start(&self) -> bool {
        self.state == HeaderState::Start
    }

    pub(crate) fn token_start(&self) -> usize {
        self.header_name_start as usize
    }

    pub(crate) fn relocate(&mut self, moved: u32) {
        self.header_name_start -= moved;
        for m in [
            &mut self.header_name_end,
            &mut self.header_start,
            &mut self.header_end,
        ] {
            if *m >= moved {
                *m -= moved;
            } else {
                *m = 0;
            }
        }
    }

    pub(crate) fn name_span(&self, buf: u16) -> Span {
        Span::new(buf, self.header_name_start, self.header_name_end)
    }

    pub(crate) fn value_span(&self, buf: u16) -> Span {
        Span::new(buf, self.header_start, self.header_end)
    }
}

fn is_header_name_byte(b: u8, allow_underscores: bool) -> Option<bool> {
    // Some(valid) for bytes that may appear in a line; None for hard errors.
    match b {
        b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' => Some(true),
        b'_' => Some(allow_underscores),
        0 => None,
        _ => Some(false),
    }
}

/// Advances the header-line machine over `buf[*pos..]`.
///
/// Returns `Header` once per completed line, `Done` on the blank line. A
/// line that is malformed but still framed by CRLF completes with
/// `ctx.invalid` set instead of erroring, so `ignore_invalid_headers` can
/// skip it.
pub(crate) fn parse_header_line(
    buf: &[u8],
    pos: &mut usize,
    ctx: &mut HeaderCtx,
) -> Result<HeaderStatus, Parse> {
    use self::HeaderState::*;

    let mut p = *pos;
    let mut state = ctx.state;

    macro_rules! done {
        ($status:expr) => {{
            ctx.state = Start;
            *pos = p + 1;
            return Ok($status);
        }};
    }

    while p < buf.len() {
        let ch = buf[p];
        match state {
            Start => match ch {
                b'\r' => state = HeaderAlmostDone,
                b'\n' => done!(HeaderStatus::Done),
                _ => {
                    ctx.header_name_start = p as u32;
                    ctx.invalid = false;
                    state = Name;
                    continue;
                }
            },
            Name => match ch {
                b':' => {
                    ctx.header_name_end = p as u32;
                    state = SpaceBeforeValue;
                }
                b'\r' => {
                    // header line with no colon
                    ctx.header_name_end = p as u32;
                    ctx.header_start = p as u32;
                    ctx.header_end = p as u32;
                    ctx.invalid = true;
                    state = AlmostDone;
                }
                b'\n' => {
                    ctx.header_name_end = p as u32;
                    ctx.header_start = p as u32;
                    ctx.header_end = p as u32;
                    ctx.invalid = true;
                    done!(HeaderStatus::Header);
                }
                _ => match is_header_name_byte(ch, ctx.allow_underscores) {
                    Some(true) => {}
                    Some(false) => ctx.invalid = true,
                    None => return Err(Parse::Header),
                },
            },
            SpaceBeforeValue => match ch {
                b' ' | b'\t' => {}
                b'\r' => {
                    ctx.header_start = p as u32;
                    ctx.header_end = p as u32;
                    state = AlmostDone;
                }
                b'\n' => {
                    ctx.header_start = p as u32;
                    ctx.header_end = p as u32;
                    done!(HeaderStatus::Header);
                }
                0 => return Err(Parse::Header),
                _ => {
                    ctx.header_start = p as u32;
                    state = Value;
                }
            },
            Value => match ch {
                b' ' => {
                    ctx.header_end = p as u32;
                    state = SpaceAfterValue;
                }
                b'\r' => {
                    ctx.header_end = p as u32;
                    state = AlmostDone;
                }
                b'\n' => {
                    ctx.header_end = p as u32;
                    done!(HeaderStatus::Header);
                }
                0 => return Err(Parse::Header),
                _ => {}
            },
            SpaceAfterValue => match ch {
                b' ' => {}
                b'\r' => state = AlmostDone,
                b'\n' => done!(HeaderStatus::Header),
                0 => return Err(Parse::Header),
                _ => state = Value,
            },
            AlmostDone => match ch {
                b'\n' => done!(HeaderStatus::Header),
                b'\r' => return Err(Parse::Header),
                _ => return Err(Parse::Header),
            },
            HeaderAlmostDone => match ch {
                b'\n' => done!(HeaderStatus::Done),
                _ => return Err(Parse::Header),
            },
        }
        p += 1;
    }

    ctx.state = state;
    *pos = p;
    Ok(HeaderStatus::Again)
}
