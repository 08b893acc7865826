//! Per-server tunables recognized by the connection engine.

use std::time::Duration;

/// Policy for draining residual client bytes before fully closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LingeringClose {
    /// Never linger; close both directions at once.
    Off,
    /// Linger when the request hints the client may still be sending.
    On,
    /// Always linger after the response.
    Always,
}

impl Default for LingeringClose {
    fn default() -> Self {
        LingeringClose::On
    }
}

/// Disable keepalive for browser families with known brokenness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepaliveDisable {
    pub msie6: bool,
    pub safari: bool,
}

/// Connection-engine options, usually attached to a virtual server.
///
/// The builder methods mirror the configuration directives the engine
/// recognizes; everything has a usable default.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub(crate) client_header_buffer_size: usize,
    pub(crate) large_client_header_buffers: (usize, usize),
    pub(crate) client_header_timeout: Duration,
    pub(crate) keepalive_timeout: Duration,
    pub(crate) send_timeout: Duration,
    pub(crate) lingering_close: LingeringClose,
    pub(crate) lingering_time: Duration,
    pub(crate) lingering_timeout: Duration,
    pub(crate) reset_timedout_connection: bool,
    pub(crate) merge_slashes: bool,
    pub(crate) underscores_in_headers: bool,
    pub(crate) ignore_invalid_headers: bool,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_nopush: bool,
    pub(crate) limit_rate: u64,
    pub(crate) max_subrequests: usize,
    pub(crate) keepalive_disable: KeepaliveDisable,
    pub(crate) log_subrequest: bool,
    pub(crate) post_action: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            client_header_buffer_size: 1024,
            large_client_header_buffers: (4, 8 * 1024),
            client_header_timeout: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(75),
            send_timeout: Duration::from_secs(60),
            lingering_close: LingeringClose::On,
            lingering_time: Duration::from_secs(30),
            lingering_timeout: Duration::from_secs(5),
            reset_timedout_connection: false,
            merge_slashes: true,
            underscores_in_headers: false,
            ignore_invalid_headers: true,
            tcp_nodelay: true,
            tcp_nopush: false,
            limit_rate: 0,
            max_subrequests: 50,
            keepalive_disable: KeepaliveDisable {
                msie6: true,
                safari: false,
            },
            log_subrequest: false,
            post_action: None,
        }
    }
}

impl ServerOptions {
    pub fn new() -> ServerOptions {
        ServerOptions::default()
    }

    /// Initial input buffer size for the request head.
    ///
    /// Default is 1KB.
    pub fn client_header_buffer_size(&mut self, sz: usize) -> &mut Self {
        assert!(sz > 0, "client_header_buffer_size must be non-zero");
        self.client_header_buffer_size = sz;
        self
    }

    /// Bound (`num`, `size`) of the large-header buffer pool.
    ///
    /// Default is 4 buffers of 8KB.
    pub fn large_client_header_buffers(&mut self, num: usize, size: usize) -> &mut Self {
        assert!(num > 0 && size > 0, "large buffer pool must be non-empty");
        self.large_client_header_buffers = (num, size);
        self
    }

    /// Per-read budget while parsing the request head.
    pub fn client_header_timeout(&mut self, dur: Duration) -> &mut Self {
        self.client_header_timeout = dur;
        self
    }

    /// Idle budget between requests on one connection. Zero disables
    /// keepalive entirely.
    pub fn keepalive_timeout(&mut self, dur: Duration) -> &mut Self {
        self.keepalive_timeout = dur;
        self
    }

    /// Per-write budget while sending the response.
    pub fn send_timeout(&mut self, dur: Duration) -> &mut Self {
        self.send_timeout = dur;
        self
    }

    /// Residual-drain policy on close.
    pub fn lingering_close(&mut self, mode: LingeringClose) -> &mut Self {
        self.lingering_close = mode;
        self
    }

    /// Absolute budget for the lingering drain.
    pub fn lingering_time(&mut self, dur: Duration) -> &mut Self {
        self.lingering_time = dur;
        self
    }

    /// Per-read budget during the lingering drain.
    pub fn lingering_timeout(&mut self, dur: Duration) -> &mut Self {
        self.lingering_timeout = dur;
        self
    }

    /// On timeout, close with RST instead of FIN to bypass TIME_WAIT.
    ///
    /// This also overrides `lingering_close(Always)` on timed-out
    /// connections: a reset never lingers.
    pub fn reset_timedout_connection(&mut self, enabled: bool) -> &mut Self {
        self.reset_timedout_connection = enabled;
        self
    }

    /// Collapse `//` sequences while normalizing the URI.
    pub fn merge_slashes(&mut self, enabled: bool) -> &mut Self {
        self.merge_slashes = enabled;
        self
    }

    /// Accept `_` in header names instead of treating them as invalid.
    pub fn underscores_in_headers(&mut self, enabled: bool) -> &mut Self {
        self.underscores_in_headers = enabled;
        self
    }

    /// Skip header lines that fail to parse instead of rejecting the
    /// request with a 400.
    pub fn ignore_invalid_headers(&mut self, enabled: bool) -> &mut Self {
        self.ignore_invalid_headers = enabled;
        self
    }

    /// Enable TCP_NODELAY once the connection enters keepalive.
    pub fn tcp_nodelay(&mut self, enabled: bool) -> &mut Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Corking-style batching during the response; the pending flush is
    /// paid before keepalive.
    pub fn tcp_nopush(&mut self, enabled: bool) -> &mut Self {
        self.tcp_nopush = enabled;
        self
    }

    /// Response bandwidth cap in bytes per second. Zero is unlimited.
    pub fn limit_rate(&mut self, bytes_per_sec: u64) -> &mut Self {
        self.limit_rate = bytes_per_sec;
        self
    }

    /// Bound on subrequests spawned per client request.
    pub fn max_subrequests(&mut self, n: usize) -> &mut Self {
        self.max_subrequests = n;
        self
    }

    /// Disable keepalive for the given browser families.
    pub fn keepalive_disable(&mut self, disable: KeepaliveDisable) -> &mut Self {
        self.keepalive_disable = disable;
        self
    }

    /// Run the access-log hook for completed subrequests too.
    pub fn log_subrequest(&mut self, enabled: bool) -> &mut Self {
        self.log_subrequest = enabled;
        self
    }

    /// After each completed request, internally re-enter the pipeline for
    /// this URI.
    pub fn post_action(&mut self, uri: impl Into<String>) -> &mut Self {
        self.post_action = Some(uri.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chains() {
        let mut opts = ServerOptions::new();
        opts.client_header_buffer_size(2048)
            .large_client_header_buffers(2, 16 * 1024)
            .keepalive_timeout(Duration::from_secs(5))
            .merge_slashes(false)
            .limit_rate(1024);
        assert_eq!(opts.client_header_buffer_size, 2048);
        assert_eq!(opts.large_client_header_buffers, (2, 16 * 1024));
        assert!(!opts.merge_slashes);
        assert_eq!(opts.limit_rate, 1024);
    }

    #[test]
    #[should_panic]
    fn zero_header_buffer_rejected() {
        ServerOptions::new().client_header_buffer_size(0);
    }
}
