#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

//! # faultline
//!
//! faultline is a pooled HTTP client that keeps a fault on one request
//! from leaking into any other request, including requests multiplexed on
//! the very same connection.
//!
//! - HTTP/1.1 over plaintext or TLS, HTTP/2 negotiated with ALPN or spoken
//!   with prior knowledge.
//! - Connections pooled per [`Target`], with a per-target limit and an idle
//!   timeout.
//! - Every request resolves exactly once. A failure carries a [`FaultKind`]
//!   saying what went wrong, for instance
//!   [`FaultKind::PrematureTermination`] when the peer hung up before
//!   sending any part of a response.
//! - A fault costs at most the connection it happened on (HTTP/1.1), or
//!   only the stream (HTTP/2).
//!
//! Start with [`Client`].

pub use http;

pub use crate::client::connect::{Target, TlsConfig};
pub use crate::client::{Builder, Client, ConnState, ConnectionInfo, ResponseFuture};
pub use crate::error::{Error, FaultKind, Result};

#[macro_use]
mod common;
pub mod client;
mod error;
mod proto;
pub mod rt;
