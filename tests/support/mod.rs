#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use gable::{AccessEntry, Engine, PhaseResult, Phases, ReqId, ServerBlock, ServerOptions, VirtualServers};

/// One scripted transport event on the read side.
pub enum Step {
    /// Deliver these bytes (possibly across several reads if the engine's
    /// buffer is smaller).
    Data(Vec<u8>),
    /// Return `Pending` forever; pair with a paused clock and a timer.
    Stall,
}

pub fn data(bytes: &[u8]) -> Step {
    Step::Data(bytes.to_vec())
}

/// A scripted client connection: reads come from the script (EOF once it
/// runs out), writes are captured.
pub struct Mock {
    script: VecDeque<Step>,
    written: Arc<Mutex<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
}

pub struct MockHandles {
    pub written: Arc<Mutex<Vec<u8>>>,
    pub shutdown: Arc<AtomicBool>,
}

impl MockHandles {
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn shutdown_called(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

pub fn mock(script: Vec<Step>) -> (Mock, MockHandles) {
    let _ = pretty_env_logger::try_init();
    let written = Arc::new(Mutex::new(Vec::new()));
    let shutdown = Arc::new(AtomicBool::new(false));
    (
        Mock {
            script: script.into(),
            written: written.clone(),
            shutdown: shutdown.clone(),
        },
        MockHandles { written, shutdown },
    )
}

impl AsyncRead for Mock {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.script.front_mut() {
            None => Poll::Ready(Ok(())), // EOF
            Some(Step::Stall) => Poll::Pending,
            Some(Step::Data(d)) => {
                let n = buf.remaining().min(d.len());
                buf.put_slice(&d[..n]);
                if n == d.len() {
                    this.script.pop_front();
                } else {
                    d.drain(..n);
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl AsyncWrite for Mock {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdown.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Phase pipeline built from a closure, with captured access-log entries.
pub struct Svc<F> {
    f: F,
    pub logs: Arc<Mutex<Vec<AccessEntry>>>,
}

pub fn svc<F>(f: F) -> (Svc<F>, Arc<Mutex<Vec<AccessEntry>>>)
where
    F: FnMut(ReqId, &mut Engine<'_>) -> PhaseResult,
{
    let logs = Arc::new(Mutex::new(Vec::new()));
    (
        Svc {
            f,
            logs: logs.clone(),
        },
        logs,
    )
}

impl<F> Phases for Svc<F>
where
    F: FnMut(ReqId, &mut Engine<'_>) -> PhaseResult,
{
    fn run(&mut self, req: ReqId, engine: &mut Engine<'_>) -> PhaseResult {
        (self.f)(req, engine)
    }

    fn access_log(&mut self, entry: &AccessEntry) {
        self.logs.lock().unwrap().push(AccessEntry {
            method: entry.method.clone(),
            path: entry.path.clone(),
            status: entry.status,
            sent: entry.sent,
            subrequest: entry.subrequest,
            server: entry.server.clone(),
            at: entry.at,
        });
    }
}

pub fn vhosts(opts: ServerOptions) -> Arc<VirtualServers> {
    Arc::new(VirtualServers::single(ServerBlock::new("test", opts)))
}

/// Sends a complete fixed-length response; the common case in these tests.
pub fn respond(e: &mut Engine<'_>, req: ReqId, body: &[u8]) -> PhaseResult {
    e.request_mut(req).headers_out_mut().content_length = Some(body.len() as u64);
    if e.send_header(req).is_err() {
        return PhaseResult::Error;
    }
    if e.output(req, body.to_vec(), true).is_err() {
        return PhaseResult::Error;
    }
    PhaseResult::Ok
}
