//! gable
//!
//! A fast per-connection HTTP/1.x request lifecycle engine for reverse
//! proxies and origin servers.
//!
//! Given an accepted stream, a [`Connection`] ingests raw bytes, parses
//! the request head incrementally over growable header buffers, resolves
//! the virtual server by SNI or `Host`, hands the request to a pluggable
//! phase pipeline, splices subrequest output into the response in strict
//! depth-first order, drives the write side with send timeouts and
//! bandwidth limiting, and decides per request whether the connection is
//! reused, half-closed with a lingering drain, or torn down.
//!
//! The pieces this crate deliberately does *not* own: the accept loop,
//! TLS record processing (see [`sniff`] for the first-byte dispatch),
//! individual phase handlers, and HTTP/2.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gable::{
//!     Connection, Engine, PhaseResult, Phases, Plain, ReqId, ServerBlock,
//!     ServerOptions, VirtualServers,
//! };
//!
//! struct Hello;
//!
//! impl Phases for Hello {
//!     fn run(&mut self, req: ReqId, e: &mut Engine<'_>) -> PhaseResult {
//!         e.request_mut(req).headers_out_mut().content_length = Some(2);
//!         if e.send_header(req).is_err() {
//!             return PhaseResult::Error;
//!         }
//!         if e.output(req, &b"hi"[..], true).is_err() {
//!             return PhaseResult::Error;
//!         }
//!         PhaseResult::Ok
//!     }
//! }
//!
//! # async fn serve(stream: tokio::net::TcpStream) -> gable::Result<()> {
//! let vhosts = Arc::new(VirtualServers::single(ServerBlock::new(
//!     "localhost",
//!     ServerOptions::default(),
//! )));
//! Connection::new(Plain::new(stream), vhosts, Hello).await
//! # }
//! ```

mod common;
mod config;
mod error;
mod phase;
mod proto;
mod vhost;

pub use crate::config::{KeepaliveDisable, LingeringClose, ServerOptions};
pub use crate::error::{Error, Result};
pub use crate::phase::{AccessEntry, BodyFilter, PhaseResult, Phases};
pub use crate::proto::h1::conn::{Builder, Connection};
pub use crate::proto::h1::headers::BrowserFlags;
pub use crate::proto::h1::intake::{sniff, ProxiedAddrs, Protocol};
pub use crate::proto::h1::io::{Plain, Transport};
pub use crate::proto::h1::lifecycle::{BodyRead, Engine};
pub use crate::proto::h1::request::{PostSubrequest, ReqId, Request, ResponseHead};
pub use crate::vhost::{BadServerName, Builder as VirtualServersBuilder, ServerBlock, VirtualServers};
