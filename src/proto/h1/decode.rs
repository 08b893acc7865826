//! Request-body framing decoders.
//!
//! The engine itself only ever *drains* bodies (to keep a connection
//! reusable after a handler ignored the body), so the decoder works
//! directly over buffered bytes and reports how many it consumed.

use std::fmt;

use crate::error::Parse;

use self::Kind::{Chunked, Length};

/// Decoders to handle different Transfer-Encodings.
#[derive(Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    /// Used when a Content-Length header was sent with a positive integer.
    Length(u64),
    /// Used when Transfer-Encoding is `chunked`.
    Chunked(ChunkedState, u64),
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked(ChunkedState::Size, 0),
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(self.kind, Length(0) | Chunked(ChunkedState::End, _))
    }

    /// Consumes body framing from `buf`, returning how many bytes belonged
    /// to this message. Call again with more bytes until `is_eof`. When
    /// `out` is given, de-framed body bytes are appended to it; a discard
    /// passes `None`.
    pub(crate) fn decode(
        &mut self,
        buf: &[u8],
        mut out: Option<&mut Vec<u8>>,
    ) -> Result<usize, Parse> {
        match self.kind {
            Length(ref mut remaining) => {
                let n = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= n as u64;
                if let Some(o) = out.as_deref_mut() {
                    o.extend_from_slice(&buf[..n]);
                }
                Ok(n)
            }
            Chunked(ref mut state, ref mut size) => {
                let mut pos = 0;
                while pos < buf.len() && *state != ChunkedState::End {
                    *state = state.step(buf, &mut pos, size, &mut out)?;
                }
                Ok(pos)
            }
        }
    }

    /// Like [`Decoder::decode`], ignoring the body bytes.
    pub(crate) fn drain(&mut self, buf: &[u8]) -> Result<usize, Parse> {
        self.decode(buf, None)
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

impl ChunkedState {
    fn step(
        &self,
        buf: &[u8],
        pos: &mut usize,
        size: &mut u64,
        out: &mut Option<&mut Vec<u8>>,
    ) -> Result<ChunkedState, Parse> {
        use self::ChunkedState::*;

        let byte = buf[*pos];
        match *self {
            Size => {
                let digit = match byte {
                    b'0'..=b'9' => byte - b'0',
                    b'a'..=b'f' => byte + 10 - b'a',
                    b'A'..=b'F' => byte + 10 - b'A',
                    _ => {
                        return match byte {
                            b'\t' | b' ' => {
                                *pos += 1;
                                Ok(SizeLws)
                            }
                            b';' => {
                                *pos += 1;
                                Ok(Extension)
                            }
                            b'\r' => {
                                *pos += 1;
                                Ok(SizeLf)
                            }
                            _ => Err(Parse::Header),
                        };
                    }
                };
                *size = size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add(digit as u64))
                    .ok_or(Parse::Header)?;
                *pos += 1;
                Ok(Size)
            }
            SizeLws => {
                *pos += 1;
                match byte {
                    b'\t' | b' ' => Ok(SizeLws),
                    b';' => Ok(Extension),
                    b'\r' => Ok(SizeLf),
                    _ => Err(Parse::Header),
                }
            }
            Extension => {
                *pos += 1;
                match byte {
                    b'\r' => Ok(SizeLf),
                    _ => Ok(Extension),
                }
            }
            SizeLf => {
                *pos += 1;
                match byte {
                    b'\n' if *size > 0 => Ok(Body),
                    b'\n' => Ok(EndCr),
                    _ => Err(Parse::Header),
                }
            }
            Body => {
                let n = (*size).min((buf.len() - *pos) as u64) as usize;
                if let Some(o) = out.as_deref_mut() {
                    o.extend_from_slice(&buf[*pos..*pos + n]);
                }
                *pos += n;
                *size -= n as u64;
                if *size == 0 {
                    Ok(BodyCr)
                } else {
                    Ok(Body)
                }
            }
            BodyCr => {
                *pos += 1;
                match byte {
                    b'\r' => Ok(BodyLf),
                    _ => Err(Parse::Header),
                }
            }
            BodyLf => {
                *pos += 1;
                match byte {
                    b'\n' => Ok(Size),
                    _ => Err(Parse::Header),
                }
            }
            // after the last chunk: either trailers or the final CRLF
            EndCr => {
                *pos += 1;
                match byte {
                    b'\r' => Ok(EndLf),
                    _ => Ok(Trailer),
                }
            }
            Trailer => {
                *pos += 1;
                match byte {
                    b'\r' => Ok(TrailerLf),
                    _ => Ok(Trailer),
                }
            }
            TrailerLf => {
                *pos += 1;
                match byte {
                    b'\n' => Ok(EndCr),
                    _ => Err(Parse::Header),
                }
            }
            EndLf => {
                *pos += 1;
                match byte {
                    b'\n' => Ok(End),
                    _ => Err(Parse::Header),
                }
            }
            End => Ok(End),
        }
    }
}
