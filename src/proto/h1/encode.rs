//! Response-head serialization and body framing.

use bytes::Bytes;
use http::{StatusCode, Version};
use tracing::trace;

use crate::common::date;

use super::io::WriteBuf;
use super::request::ResponseHead;

const AVERAGE_HEADER_SIZE: usize = 30;

/// How the response body is framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Encoder {
    /// Fixed-size body from a `Content-Length`.
    Length(u64),
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
    /// No body bytes may follow the head.
    Empty,
    /// Close-delimited body (HTTP/1.0 without a length).
    CloseDelimited,
    /// Terminal chunk already written; everything further is dropped.
    Done,
}

impl Encoder {
    /// Appends one body frame to the outgoing buffer.
    pub(crate) fn frame(&mut self, data: Bytes, dst: &mut WriteBuf) {
        if data.is_empty() {
            return;
        }
        match self {
            Encoder::Length(remaining) => {
                let n = (data.len() as u64).min(*remaining);
                *remaining -= n;
                dst.buffer(data.slice(..n as usize));
            }
            Encoder::Chunked => {
                dst.extend(format!("{:x}\r\n", data.len()).as_bytes());
                dst.buffer(data);
                dst.extend(b"\r\n");
            }
            Encoder::CloseDelimited => dst.buffer(data),
            Encoder::Empty | Encoder::Done => {
                trace!("dropping {} body bytes after end of message", data.len());
            }
        }
    }

    /// Ends the body; chunked framing emits the terminal chunk.
    pub(crate) fn finish(&mut self, dst: &mut WriteBuf) {
        if let Encoder::Chunked = self {
            dst.extend(b"0\r\n\r\n");
        }
        *self = Encoder::Done;
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self, Encoder::Done) || matches!(self, Encoder::Length(0))
    }
}

fn status_without_body(status: StatusCode) -> bool {
    status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_informational()
}

/// Serializes the response head and picks the body encoder.
///
/// `head_only` suppresses the body (HEAD requests) without changing the
/// advertised length.
pub(crate) fn encode_head(
    head: &mut ResponseHead,
    version: Version,
    keepalive: bool,
    head_only: bool,
    dst: &mut WriteBuf,
) -> Encoder {
    let mut buf = Vec::with_capacity(30 + head.headers.len() * AVERAGE_HEADER_SIZE);

    if version == Version::HTTP_11 && head.status == StatusCode::OK {
        buf.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    } else {
        if version == Version::HTTP_10 {
            buf.extend_from_slice(b"HTTP/1.0 ");
        } else {
            buf.extend_from_slice(b"HTTP/1.1 ");
        }
        let mut code = itoa::Buffer::new();
        buf.extend_from_slice(code.format(head.status.as_u16()).as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(
            head.status
                .canonical_reason()
                .unwrap_or("Unknown")
                .as_bytes(),
        );
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"Server: gable\r\n");
    if !head.headers.contains_key(http::header::DATE) {
        buf.extend_from_slice(b"Date: ");
        date::extend(&mut buf);
        buf.extend_from_slice(b"\r\n");
    }

    let encoder = if status_without_body(head.status) {
        Encoder::Empty
    } else if let Some(len) = head.content_length {
        buf.extend_from_slice(b"Content-Length: ");
        let mut n = itoa::Buffer::new();
        buf.extend_from_slice(n.format(len).as_bytes());
        buf.extend_from_slice(b"\r\n");
        if head_only {
            Encoder::Empty
        } else {
            Encoder::Length(len)
        }
    } else if version == Version::HTTP_11 {
        buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        if head_only {
            Encoder::Empty
        } else {
            Encoder::Chunked
        }
    } else if head_only {
        Encoder::Empty
    } else {
        Encoder::CloseDelimited
    };

    // close-delimited bodies cannot be followed by another response
    let keepalive = keepalive && !matches!(encoder, Encoder::CloseDelimited);
    if keepalive {
        if version < Version::HTTP_11 {
            buf.extend_from_slice(b"Connection: keep-alive\r\n");
        }
    } else {
        buf.extend_from_slice(b"Connection: close\r\n");
    }

    for (name, value) in head.headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");

    head.sent = true;
    dst.extend(&buf);
    encoder
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn head(status: StatusCode, len: Option<u64>) -> ResponseHead {
        ResponseHead {
            status,
            headers: HeaderMap::new(),
            content_length: len,
            sent: false,
        }
    }

    fn encode_to_string(
        h: &mut ResponseHead,
        version: Version,
        keepalive: bool,
        head_only: bool,
    ) -> (String, Encoder) {
        let mut dst = WriteBuf::for_tests();
        let enc = encode_head(h, version, keepalive, head_only, &mut dst);
        (String::from_utf8(dst.take_for_tests()).unwrap(), enc)
    }

    #[test]
    fn fast_path_200() {
        let mut h = head(StatusCode::OK, Some(5));
        let (s, enc) = encode_to_string(&mut h, Version::HTTP_11, true, false);
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.contains("Date: "));
        assert!(!s.contains("Connection:"));
        assert_eq!(enc, Encoder::Length(5));
        assert!(h.sent);
    }

    #[test]
    fn status_line_with_reason() {
        let mut h = head(StatusCode::NOT_FOUND, Some(0));
        let (s, _) = encode_to_string(&mut h, Version::HTTP_11, false, false);
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn http10_keepalive_is_explicit() {
        let mut h = head(StatusCode::OK, Some(0));
        let (s, _) = encode_to_string(&mut h, Version::HTTP_10, true, false);
        assert!(s.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(s.contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn chunked_when_length_unknown() {
        let mut h = head(StatusCode::OK, None);
        let (s, enc) = encode_to_string(&mut h, Version::HTTP_11, true, false);
        assert!(s.contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(enc, Encoder::Chunked);
    }

    #[test]
    fn http10_unknown_length_closes() {
        let mut h = head(StatusCode::OK, None);
        let (s, enc) = encode_to_string(&mut h, Version::HTTP_10, true, false);
        assert_eq!(enc, Encoder::CloseDelimited);
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn head_only_advertises_but_suppresses() {
        let mut h = head(StatusCode::OK, Some(10));
        let (s, enc) = encode_to_string(&mut h, Version::HTTP_11, true, true);
        assert!(s.contains("Content-Length: 10\r\n"));
        assert_eq!(enc, Encoder::Empty);
    }

    #[test]
    fn chunked_framing() {
        let mut dst = WriteBuf::for_tests();
        let mut enc = Encoder::Chunked;
        enc.frame(Bytes::from_static(b"hello"), &mut dst);
        enc.finish(&mut dst);
        assert_eq!(dst.take_for_tests(), b"5\r\nhello\r\n0\r\n\r\n");
        assert!(enc.is_done());
    }

    #[test]
    fn length_framing_caps_overrun() {
        let mut dst = WriteBuf::for_tests();
        let mut enc = Encoder::Length(3);
        enc.frame(Bytes::from_static(b"hello"), &mut dst);
        assert_eq!(dst.take_for_tests(), b"hel");
        assert!(enc.is_done());
    }
}
