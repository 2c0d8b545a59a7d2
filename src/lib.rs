#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # relay_pool
//!
//! `relay_pool` supervises a fixed-size (but growable) pool of worker child
//! processes for a local-development reverse proxy, and speaks the
//! netstring-framed, CGI-style protocol each worker exposes over a
//! UNIX-domain socket.
//!
//! Three pieces compose the crate:
//!
//! - [`client`] — the wire protocol: netstring framing, environment-map
//!   construction, and the request/response exchange over one worker
//!   socket.
//! - [`worker`] — one supervised child process: its spawn sequence,
//!   handshake pipe, idle timer, and state machine.
//! - [`pool`] — a collection of workers sharing a round-robin/readiness
//!   scheduling policy and aggregated stdout/stderr streams.
//!
//! None of this is an HTTP server; embedding code is expected to translate
//! an inbound `http::Request` into a [`worker::ProxyRequest`], call
//! [`pool::Pool::proxy`], and translate the result back into an
//! `http::Response`.

#[doc(no_inline)]
pub use http::{HeaderMap, Method, StatusCode};

pub use crate::error::{Error, Result};

pub mod aggregate;
pub mod client;
mod common;
pub mod env;
mod error;
mod netstring;
pub mod pool;
pub mod worker;
