//! URI post-processing and host validation.

use bytes::Bytes;

use crate::error::Parse;

/// The normalized request target.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestUri {
    /// Decoded, slash-merged, dot-resolved path.
    pub path: Bytes,
    /// Bytes after the first `?`, raw.
    pub query: Bytes,
    /// Bytes after the last `.` of the final path segment.
    pub ext: Bytes,
    /// The target as the client sent it.
    pub raw: Bytes,
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Normalizes a raw request target that the line parser flagged complex.
///
/// Decodes `%XX` escapes, optionally merges `//` runs, resolves `.` and
/// `..` segments without ever climbing past the root, and drops a `#`
/// fragment. The query string is split off before any decoding.
pub(crate) fn normalize(raw: &[u8], merge_slashes: bool) -> Result<(Vec<u8>, Vec<u8>), Parse> {
    let (path_raw, query) = match raw.iter().position(|&b| b == b'?') {
        Some(i) => (&raw[..i], raw[i + 1..].to_vec()),
        None => (raw, Vec::new()),
    };

    // Decode escapes first; dot segments may be escaped themselves.
    let mut decoded = Vec::with_capacity(path_raw.len());
    let mut i = 0;
    while i < path_raw.len() {
        let b = path_raw[i];
        match b {
            b'%' => {
                let hi = path_raw.get(i + 1).copied().and_then(hex_value);
                let lo = path_raw.get(i + 2).copied().and_then(hex_value);
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        let ch = (h << 4) | l;
                        if ch == 0 {
                            return Err(Parse::Uri);
                        }
                        decoded.push(ch);
                        i += 3;
                    }
                    _ => return Err(Parse::Uri),
                }
            }
            b'#' => break,
            0 => return Err(Parse::Uri),
            _ => {
                decoded.push(b);
                i += 1;
            }
        }
    }

    if decoded.first() != Some(&b'/') {
        return Err(Parse::Uri);
    }

    // Resolve segments over the decoded bytes.
    let mut out: Vec<u8> = Vec::with_capacity(decoded.len());
    let mut seg = 0;
    let n = decoded.len();
    while seg < n {
        debug_assert_eq!(decoded[seg], b'/');
        let mut end = seg + 1;
        while end < n && decoded[end] != b'/' {
            end += 1;
        }
        let segment = &decoded[seg + 1..end];
        match segment {
            b"" if end < n => {
                // an empty segment from "//"
                if !merge_slashes {
                    out.push(b'/');
                }
            }
            b"." => {
                // dropped; a trailing "/." keeps the slash
                if end == n {
                    out.push(b'/');
                }
            }
            b".." => {
                // pop one segment, never past the root
                match out.iter().rposition(|&b| b == b'/') {
                    Some(idx) => out.truncate(idx),
                    None if out.is_empty() => return Err(Parse::Uri),
                    None => out.clear(),
                }
                if end == n {
                    out.push(b'/');
                }
            }
            _ => {
                out.push(b'/');
                out.extend_from_slice(segment);
            }
        }
        seg = end;
    }
    if out.is_empty() {
        out.push(b'/');
    }

    Ok((out, query))
}

/// File extension of the final path segment, if any.
pub(crate) fn extension(path: &[u8]) -> &[u8] {
    let last_seg = match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    };
    match last_seg.iter().rposition(|&b| b == b'.') {
        Some(i) => &last_seg[i + 1..],
        None => &[],
    }
}

/// Validates and canonicalizes a host string: lowercases, strips one
/// trailing dot and any `:port`, keeps IPv6 literals bracketed.
pub(crate) fn validate_host(host: &[u8]) -> Result<String, Parse> {
    #[derive(PartialEq)]
    enum Sw {
        Usual,
        Literal,
        Rest,
    }

    let mut dot_pos = host.len();
    let mut host_len = host.len();
    let mut state = Sw::Usual;

    for (i, &ch) in host.iter().enumerate() {
        match ch {
            b'.' => {
                if i > 0 && dot_pos == i - 1 {
                    return Err(Parse::HostInvalid);
                }
                dot_pos = i;
            }
            b':' => {
                if state == Sw::Usual {
                    host_len = i;
                    state = Sw::Rest;
                }
            }
            b'[' => {
                if i == 0 {
                    state = Sw::Literal;
                }
            }
            b']' => {
                if state == Sw::Literal {
                    host_len = i + 1;
                    state = Sw::Rest;
                }
            }
            0 => return Err(Parse::HostInvalid),
            b'/' | b'\\' => return Err(Parse::HostInvalid),
            _ => {}
        }
    }

    if host_len > 0 && dot_pos == host_len - 1 {
        host_len -= 1;
    }
    if host_len == 0 {
        return Err(Parse::HostInvalid);
    }

    String::from_utf8(host[..host_len].to_ascii_lowercase()).map_err(|_| Parse::HostInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &[u8]) -> Result<Vec<u8>, Parse> {
        normalize(raw, true).map(|(p, _)| p)
    }

    #[test]
    fn plain_path_unchanged() {
        assert_eq!(norm(b"/a/b/c").unwrap(), b"/a/b/c");
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(norm(b"/a%20b").unwrap(), b"/a b");
        assert_eq!(norm(b"/%2e%2e/x").unwrap_err(), Parse::Uri);
        assert_eq!(norm(b"/a%2Fb").unwrap(), b"/a/b");
        assert_eq!(norm(b"/a%zz").unwrap_err(), Parse::Uri);
        assert_eq!(norm(b"/a%2").unwrap_err(), Parse::Uri);
        assert_eq!(norm(b"/a%00b").unwrap_err(), Parse::Uri);
    }

    #[test]
    fn slash_merging() {
        assert_eq!(norm(b"/a//b///c").unwrap(), b"/a/b/c");
        let (p, _) = normalize(b"/a//b", false).unwrap();
        assert_eq!(p, b"/a//b");
    }

    #[test]
    fn dot_segments() {
        assert_eq!(norm(b"/a/./b").unwrap(), b"/a/b");
        assert_eq!(norm(b"/a/b/../c").unwrap(), b"/a/c");
        assert_eq!(norm(b"/a/b/..").unwrap(), b"/a/");
        assert_eq!(norm(b"/a/.").unwrap(), b"/a/");
        assert_eq!(norm(b"/..").unwrap_err(), Parse::Uri);
        assert_eq!(norm(b"/a/../../b").unwrap_err(), Parse::Uri);
    }

    #[test]
    fn normalization_is_idempotent() {
        let cases: &[&[u8]] = &[b"/a%20b", b"/a//b/../c", b"/a/./b/", b"/%41"];
        for case in cases {
            let (once, _) = normalize(case, true).unwrap();
            let (twice, _) = normalize(&once, true).unwrap();
            assert_eq!(once, twice, "case {:?}", case);
        }
    }

    #[test]
    fn query_split_is_raw() {
        let (p, q) = normalize(b"/a?b=%20", true).unwrap();
        assert_eq!(p, b"/a");
        assert_eq!(q, b"b=%20");
    }

    #[test]
    fn fragment_dropped() {
        assert_eq!(norm(b"/a#frag").unwrap(), b"/a");
    }

    #[test]
    fn extension_of_last_segment() {
        assert_eq!(extension(b"/a/b.html"), b"html");
        assert_eq!(extension(b"/a.d/b"), b"");
        assert_eq!(extension(b"/a"), b"");
        assert_eq!(extension(b"/a/b.tar.gz"), b"gz");
    }

    #[test]
    fn host_validation() {
        assert_eq!(validate_host(b"Example.COM").unwrap(), "example.com");
        assert_eq!(validate_host(b"example.com:8080").unwrap(), "example.com");
        assert_eq!(validate_host(b"example.com.").unwrap(), "example.com");
        assert_eq!(validate_host(b"[::1]:80").unwrap(), "[::1]");
        assert_eq!(validate_host(b"a..b").unwrap_err(), Parse::HostInvalid);
        assert_eq!(validate_host(b"").unwrap_err(), Parse::HostInvalid);
        assert_eq!(validate_host(b":80").unwrap_err(), Parse::HostInvalid);
        assert_eq!(validate_host(b"a/b").unwrap_err(), Parse::HostInvalid);
    }
}
