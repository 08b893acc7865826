//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have `gable` `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while driving an HTTP/1 connection.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// The client took too long to send the request head.
    HeaderTimeout,
    /// The client took too long to read the response.
    SendTimeout,
    /// The peer closed the connection without a request in flight.
    PeerClosed,
    /// An `io::Error` that occurred while trying to read or write to a
    /// network stream.
    Io,
    /// The request was torn down forcefully before completing.
    Terminated,
    /// A phase handler failed in a way that has no HTTP mapping.
    Internal,
    /// Error calling `AsyncWrite::shutdown()` during lingering close.
    Shutdown,
    /// The spawning request exceeded the configured subrequest budget.
    SubrequestLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    UriTooLong,
    Header,
    HeaderName,
    TooLarge,
    ContentLength,
    TransferEncoding,
    HostMissing,
    HostInvalid,
    HostMismatch,
    MethodNotAllowed,
    ProxyProtocol,
}

impl Parse {
    /// The status the engine answers with before any handler runs.
    pub(crate) fn status(&self) -> StatusCode {
        match *self {
            Parse::UriTooLong => StatusCode::URI_TOO_LONG,
            Parse::TooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Parse::TransferEncoding => StatusCode::NOT_IMPLEMENTED,
            Parse::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Parse::HostMismatch => StatusCode::MISDIRECTED_REQUEST,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was a parse error caused by a message that was
    /// too large for the configured header buffers.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Parse(Parse::TooLarge) | Kind::Parse(Parse::UriTooLong)
        )
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the error was caused by a read or send timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::HeaderTimeout | Kind::SendTimeout)
    }

    /// Returns true if the peer closed the connection while it was idle.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::PeerClosed)
    }

    /// Returns true if this was caused by an underlying `io::Error`.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the request was torn down via the forceful path.
    pub fn is_terminated(&self) -> bool {
        matches!(self.inner.kind, Kind::Terminated)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// For parse errors, the status code the engine answers with before
    /// any handler runs.
    pub fn parse_status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(p) => Some(p.status()),
            _ => None,
        }
    }

    pub(crate) fn new_parse(p: Parse) -> Error {
        Error::new(Kind::Parse(p))
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_header_timeout() -> Error {
        Error::new(Kind::HeaderTimeout).with(TimedOut)
    }

    pub(crate) fn new_send_timeout() -> Error {
        Error::new(Kind::SendTimeout).with(TimedOut)
    }

    pub(crate) fn new_peer_closed() -> Error {
        Error::new(Kind::PeerClosed)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_terminated(status: Option<StatusCode>) -> Error {
        match status {
            Some(s) => Error::new(Kind::Terminated).with(s.to_string()),
            None => Error::new(Kind::Terminated),
        }
    }

    pub(crate) fn new_internal() -> Error {
        Error::new(Kind::Internal)
    }

    pub(crate) fn new_shutdown(cause: std::io::Error) -> Error {
        Error::new(Kind::Shutdown).with(cause)
    }

    pub(crate) fn new_subrequest_limit() -> Error {
        Error::new(Kind::SubrequestLimit)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::UriTooLong) => "URI too long",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::HeaderName) => "invalid HTTP header name",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::TransferEncoding) => "unsupported transfer-encoding",
            Kind::Parse(Parse::HostMissing) => "HTTP/1.1 request without Host header",
            Kind::Parse(Parse::HostInvalid) => "invalid Host header",
            Kind::Parse(Parse::HostMismatch) => "Host does not match negotiated server name",
            Kind::Parse(Parse::MethodNotAllowed) => "method not allowed",
            Kind::Parse(Parse::ProxyProtocol) => "invalid PROXY protocol header",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::HeaderTimeout => "client took too long to send the request head",
            Kind::SendTimeout => "client took too long to read the response",
            Kind::PeerClosed => "peer closed an idle connection",
            Kind::Io => "connection error",
            Kind::Terminated => "request terminated",
            Kind::Internal => "internal error in phase handler",
            Kind::Shutdown => "error shutting down connection",
            Kind::SubrequestLimit => "subrequest depth or count limit reached",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("gable::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<Parse> for Error {
    fn from(p: Parse) -> Error {
        Error::new_parse(p)
    }
}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}
