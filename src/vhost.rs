//! Virtual server selection by SNI or `Host`.
//!
//! Each listening address carries a set of named servers: exact names,
//! `*.`/`.`-prefixed and `*`-suffixed wildcards, and regexes tried in
//! declaration order, plus one designated default that applies when
//! nothing matches (or no host was sent at all).

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::config::ServerOptions;

/// One `server{}`-style configuration block.
#[derive(Debug)]
pub struct ServerBlock {
    /// Primary name, used for per-server log routing.
    pub name: String,
    pub options: ServerOptions,
}

impl ServerBlock {
    pub fn new(name: impl Into<String>, options: ServerOptions) -> ServerBlock {
        ServerBlock {
            name: name.into(),
            options,
        }
    }
}

/// The set of virtual servers bound to one listening address.
pub struct VirtualServers {
    servers: Vec<Arc<ServerBlock>>,
    exact: HashMap<String, usize>,
    /// `(".example.com", idx, include_bare)` suffix matchers, longest first.
    wildcard_head: Vec<(String, usize, bool)>,
    /// `("www.example.", idx)` prefix matchers, longest first.
    wildcard_tail: Vec<(String, usize)>,
    regexes: Vec<(Regex, usize)>,
    default_idx: usize,
}

pub struct Builder {
    servers: Vec<Arc<ServerBlock>>,
    names: Vec<(String, usize)>,
    regex_names: Vec<(String, usize)>,
    default_idx: Option<usize>,
}

/// Error from [`Builder::build`], carrying the offending pattern.
#[derive(Debug)]
pub struct BadServerName(pub String);

impl std::fmt::Display for BadServerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid server_name pattern: {}", self.0)
    }
}

impl std::error::Error for BadServerName {}

impl VirtualServers {
    pub fn builder() -> Builder {
        Builder {
            servers: Vec::new(),
            names: Vec::new(),
            regex_names: Vec::new(),
            default_idx: None,
        }
    }

    /// A single catch-all server; useful for tests and one-server setups.
    pub fn single(block: ServerBlock) -> VirtualServers {
        VirtualServers::builder()
            .server(block, &[])
            .build()
            .expect("no patterns to reject")
    }

    /// The designated default for this listening address.
    pub fn default_server(&self) -> &Arc<ServerBlock> {
        &self.servers[self.default_idx]
    }

    /// Resolves `host` to a server block.
    ///
    /// Lookup order: exact hash, wildcard heads, wildcard tails, regexes in
    /// declaration order. `None` means the address default stays in force.
    ///
    /// A TLS acceptor runs the same lookup in its SNI callback to pick the
    /// certificate before the handshake completes.
    pub fn resolve(&self, host: &str) -> Option<&Arc<ServerBlock>> {
        if let Some(&idx) = self.exact.get(host) {
            return Some(&self.servers[idx]);
        }
        for (suffix, idx, include_bare) in &self.wildcard_head {
            if host.ends_with(suffix.as_str()) && host.len() > suffix.len() {
                return Some(&self.servers[*idx]);
            }
            if *include_bare && host == &suffix[1..] {
                return Some(&self.servers[*idx]);
            }
        }
        for (prefix, idx) in &self.wildcard_tail {
            if host.starts_with(prefix.as_str()) && host.len() > prefix.len() {
                return Some(&self.servers[*idx]);
            }
        }
        for (re, idx) in &self.regexes {
            if re.is_match(host) {
                return Some(&self.servers[*idx]);
            }
        }
        None
    }

    /// Like [`resolve`], but falls back to the address default.
    ///
    /// [`resolve`]: VirtualServers::resolve
    pub fn resolve_or_default(&self, host: &str) -> &Arc<ServerBlock> {
        self.resolve(host).unwrap_or_else(|| self.default_server())
    }
}

impl Builder {
    /// Adds a server block with its `server_name` patterns. Regex patterns
    /// use the `~` prefix; the first server added is the default unless
    /// [`Builder::default_server`] selects another.
    pub fn server(mut self, block: ServerBlock, names: &[&str]) -> Builder {
        let idx = self.servers.len();
        self.servers.push(Arc::new(block));
        for name in names {
            if let Some(re) = name.strip_prefix('~') {
                self.regex_names.push((re.to_string(), idx));
            } else {
                self.names.push((name.to_ascii_lowercase(), idx));
            }
        }
        self
    }

    /// Marks the most recently added server as the address default.
    pub fn default_server(mut self) -> Builder {
        assert!(!self.servers.is_empty(), "no server to mark default");
        self.default_idx = Some(self.servers.len() - 1);
        self
    }

    pub fn build(self) -> Result<VirtualServers, BadServerName> {
        assert!(!self.servers.is_empty(), "at least one server required");

        let mut exact = HashMap::new();
        let mut wildcard_head = Vec::new();
        let mut wildcard_tail = Vec::new();
        let mut regexes = Vec::new();

        for (name, idx) in self.names {
            if let Some(suffix) = name.strip_prefix("*.") {
                wildcard_head.push((format!(".{}", suffix), idx, false));
            } else if name.starts_with('.') {
                wildcard_head.push((name, idx, true));
            } else if let Some(prefix) = name.strip_suffix('*') {
                if prefix.is_empty() || !prefix.ends_with('.') {
                    return Err(BadServerName(name));
                }
                wildcard_tail.push((prefix.to_string(), idx));
            } else if name.contains('*') {
                return Err(BadServerName(name));
            } else {
                exact.insert(name, idx);
            }
        }

        // longest pattern wins among wildcards
        wildcard_head.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        wildcard_tail.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        for (pattern, idx) in self.regex_names {
            let re = Regex::new(&pattern).map_err(|_| BadServerName(pattern))?;
            regexes.push((re, idx));
        }

        Ok(VirtualServers {
            servers: self.servers,
            exact,
            wildcard_head,
            wildcard_tail,
            regexes,
            default_idx: self.default_idx.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(name: &str) -> ServerBlock {
        ServerBlock::new(name, ServerOptions::default())
    }

    fn set() -> VirtualServers {
        VirtualServers::builder()
            .server(block("default"), &[])
            .server(block("exact"), &["example.com"])
            .server(block("head"), &["*.example.com"])
            .server(block("bare-head"), &[".bare.net"])
            .server(block("tail"), &["www.example.*"])
            .server(block("re"), &["~^api-[0-9]+\\.example\\.org$"])
            .build()
            .unwrap()
    }

    #[test]
    fn exact_match_first() {
        let v = set();
        assert_eq!(v.resolve("example.com").unwrap().name, "exact");
    }

    #[test]
    fn wildcard_head_matches_subdomains_only() {
        let v = set();
        assert_eq!(v.resolve("www.example.com").unwrap().name, "head");
        assert_eq!(v.resolve("a.b.example.com").unwrap().name, "head");
    }

    #[test]
    fn dot_prefix_matches_bare_domain_too() {
        let v = set();
        assert_eq!(v.resolve("bare.net").unwrap().name, "bare-head");
        assert_eq!(v.resolve("x.bare.net").unwrap().name, "bare-head");
    }

    #[test]
    fn wildcard_tail() {
        let v = set();
        assert_eq!(v.resolve("www.example.org").unwrap().name, "tail");
    }

    #[test]
    fn regex_in_declaration_order() {
        let v = set();
        assert_eq!(v.resolve("api-3.example.org").unwrap().name, "re");
    }

    #[test]
    fn unmatched_falls_back_to_default() {
        let v = set();
        assert!(v.resolve("other.host").is_none());
        assert_eq!(v.resolve_or_default("other.host").name, "default");
    }

    #[test]
    fn explicit_default_server() {
        let v = VirtualServers::builder()
            .server(block("a"), &["a.com"])
            .server(block("b"), &["b.com"])
            .default_server()
            .build()
            .unwrap();
        assert_eq!(v.default_server().name, "b");
    }

    #[test]
    fn bad_wildcard_rejected() {
        let err = VirtualServers::builder()
            .server(block("x"), &["exa*mple.com"])
            .build();
        assert!(err.is_err());
    }
}
