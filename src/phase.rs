//! The seam between the connection engine and the phase pipeline.
//!
//! Phase handlers are external: the engine hands them a request id and an
//! [`Engine`] handle, and they answer with a [`PhaseResult`]. Everything a
//! handler does afterwards (emit output, spawn subrequests, read or
//! discard the body) flows back through the handle, so the engine keeps
//! ownership of all connection state.
//!
//! [`Engine`]: crate::Engine

use http::StatusCode;

/// Result codes a handler reports through `finalize`.
///
/// These drive the finalize decision tree; see the variants for the exact
/// effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseResult {
    /// The handler's phase is done; drain buffered output, then complete.
    Ok,
    /// Same as `Ok`: the handler suspended itself and armed its own wakeup.
    Again,
    /// Count accounting only; another actor still owns the request.
    Done,
    /// Re-enter the phase pipeline with the content handler reset.
    Declined,
    /// Forceful teardown.
    Error,
    /// Forceful teardown without touching the response status.
    Close,
    /// Generate the canned response for this status, then finalize again.
    Status(StatusCode),
}

impl PhaseResult {
    pub(crate) fn is_special(&self) -> bool {
        match *self {
            PhaseResult::Status(s) => {
                s.as_u16() >= 300 || s == StatusCode::CREATED || s == StatusCode::NO_CONTENT
            }
            _ => false,
        }
    }
}

/// The external phase pipeline.
///
/// `run` is invoked once when a request head completes, and again each time
/// a posted request (re-)enters the pipeline. Subrequests run through the
/// same hook.
pub trait Phases {
    fn run(&mut self, req: crate::ReqId, engine: &mut crate::Engine<'_>) -> PhaseResult;

    /// Terminal access-log hook, called as the request is freed.
    fn access_log(&mut self, _entry: &AccessEntry) {}
}

/// What the access-log hook sees for a completed request.
#[derive(Debug)]
pub struct AccessEntry {
    pub method: http::Method,
    pub path: bytes::Bytes,
    pub status: Option<StatusCode>,
    pub sent: u64,
    pub subrequest: bool,
    pub server: String,
    /// Wall-clock time the request started.
    pub at: std::time::SystemTime,
}

/// A response body filter, run on every output chain before ordering and
/// framing. Filters may edit the chain in place; setting `buffered` on the
/// request tells the write driver to come back.
pub trait BodyFilter: Send {
    fn filter(&mut self, req: crate::ReqId, chain: &mut Vec<bytes::Bytes>) -> crate::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_statuses() {
        assert!(PhaseResult::Status(StatusCode::NOT_FOUND).is_special());
        assert!(PhaseResult::Status(StatusCode::CREATED).is_special());
        assert!(PhaseResult::Status(StatusCode::NO_CONTENT).is_special());
        assert!(!PhaseResult::Status(StatusCode::OK).is_special());
        assert!(!PhaseResult::Ok.is_special());
    }
}
