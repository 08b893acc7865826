//! First-byte dispatch for freshly accepted connections.
//!
//! TLS record processing is external: the caller peeks the opening bytes,
//! asks [`sniff`] whether they look like a handshake, runs its own
//! acceptor if so, and then hands the stream (plus anything already read)
//! to the connection with the negotiated SNI name. The PROXY protocol v1
//! prefix is consumed by the connection itself before HTTP parsing.

use std::net::{IpAddr, SocketAddr};

use crate::error::Parse;

/// What the first byte of a connection announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Plain HTTP; hand the bytes to the request parser.
    Http,
    /// A TLS record (0x16 for TLSv1+, high bit set for SSLv2).
    Tls,
}

/// Classifies the first byte the way the TLS bootstrap does.
pub fn sniff(first: u8) -> Protocol {
    if first == 0x16 || first & 0x80 != 0 {
        Protocol::Tls
    } else {
        Protocol::Http
    }
}

/// Addresses recovered from a `PROXY` protocol v1 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxiedAddrs {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Longest legal v1 line, per the haproxy spec.
const PROXY_V1_MAX: usize = 107;

/// Parses a PROXY protocol v1 line from the front of `buf`.
///
/// `Ok(None)` means the line is still incomplete. On success the consumed
/// byte count is returned along with the addresses (`None` of them for
/// `PROXY UNKNOWN`).
pub(crate) fn parse_proxy_v1(buf: &[u8]) -> Result<Option<(Option<ProxiedAddrs>, usize)>, Parse> {
    let searched = &buf[..buf.len().min(PROXY_V1_MAX)];
    let nl = match searched.iter().position(|&b| b == b'\n') {
        Some(i) => i,
        None if buf.len() >= PROXY_V1_MAX => return Err(Parse::ProxyProtocol),
        None => return Ok(None),
    };
    let consumed = nl + 1;
    let line = &buf[..nl];
    let line = line.strip_suffix(b"\r").ok_or(Parse::ProxyProtocol)?;
    let line = std::str::from_utf8(line).map_err(|_| Parse::ProxyProtocol)?;

    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(Parse::ProxyProtocol);
    }
    match parts.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => return Ok(Some((None, consumed))),
        _ => return Err(Parse::ProxyProtocol),
    }

    let src_ip: IpAddr = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Parse::ProxyProtocol)?;
    let dst_ip: IpAddr = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Parse::ProxyProtocol)?;
    let src_port: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Parse::ProxyProtocol)?;
    let dst_port: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Parse::ProxyProtocol)?;
    if parts.next().is_some() {
        return Err(Parse::ProxyProtocol);
    }

    Ok(Some((
        Some(ProxiedAddrs {
            src: SocketAddr::new(src_ip, src_port),
            dst: SocketAddr::new(dst_ip, dst_port),
        }),
        consumed,
    )))
}
