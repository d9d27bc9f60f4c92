//! Connectors used by the `Client`.
//!
//! This module contains:
//!
//! - A default [`HttpConnector`][] that does DNS resolution and establishes
//!   connections over TCP.
//! - An [`HttpsConnector`][] that wraps any other connector and performs the
//!   TLS handshake, including ALPN negotiation, for `https` targets.
//! - Types to build custom connectors.
//!
//! # Connectors
//!
//! A "connector" is a [`Service`][] that takes a [`Target`][] destination,
//! and its `Response` is some type implementing [`AsyncRead`][],
//! [`AsyncWrite`][], and [`Connection`][].
//!
//! A connector that ignores the destination and always connects to the same
//! local port could be written like this:
//!
//! ```
//! use std::{future::Future, pin::Pin, task::{self, Poll}};
//! use faultline::client::connect::Target;
//! use tokio::net::TcpStream;
//!
//! #[derive(Clone)]
//! struct LocalConnector;
//!
//! impl tower_service::Service<Target> for LocalConnector {
//!     type Response = TcpStream;
//!     type Error = std::io::Error;
//!     type Future = Pin<Box<
//!         dyn Future<Output = Result<Self::Response, Self::Error>> + Send
//!     >>;
//!
//!     fn poll_ready(&mut self, _: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
//!         Poll::Ready(Ok(()))
//!     }
//!
//!     fn call(&mut self, _: Target) -> Self::Future {
//!         Box::pin(TcpStream::connect(("127.0.0.1", 1337)))
//!     }
//! }
//! ```
//!
//! [`HttpConnector`]: HttpConnector
//! [`HttpsConnector`]: HttpsConnector
//! [`Service`]: tower_service::Service
//! [`Target`]: Target
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite
//! [`Connection`]: Connection
use std::fmt;

use ::http::uri::{Scheme, Uri};

pub use self::http::{ConnectError, HttpConnector};
pub use self::sealed::Connect;
pub use self::tls::{HandshakeError, HttpsConnector, MaybeTlsStream, TlsConfig};

mod http;
mod tls;

/// The key connections are pooled under: scheme, host and port.
///
/// Two requests share connections if and only if their targets are equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Target {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Target {
    /// Creates a target from its parts.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Target {
        let host = host.into();
        // `Uri::host` keeps the brackets around IPv6 literals
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_owned)
            .unwrap_or(host);
        Target { scheme, host, port }
    }

    /// An `http` target.
    pub fn http(host: impl Into<String>, port: u16) -> Target {
        Target::new(Scheme::HTTP, host, port)
    }

    /// An `https` target.
    pub fn https(host: impl Into<String>, port: u16) -> Target {
        Target::new(Scheme::HTTPS, host, port)
    }

    /// Extracts the target of an absolute URI.
    ///
    /// The port defaults to 80 for `http` and 443 for `https`. Any other
    /// scheme is rejected.
    pub fn from_uri(uri: &Uri) -> crate::Result<Target> {
        let scheme = match uri.scheme() {
            Some(scheme) => scheme,
            None => return Err(crate::Error::new_user_absolute_uri_required()),
        };
        let default_port = if *scheme == Scheme::HTTP {
            80
        } else if *scheme == Scheme::HTTPS {
            443
        } else {
            return Err(crate::Error::new_user_unsupported_scheme());
        };
        let host = match uri.host() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(crate::Error::new_user_absolute_uri_required()),
        };
        let port = uri.port_u16().unwrap_or(default_port);
        Ok(Target::new(scheme.clone(), host, port))
    }

    /// The scheme of this target.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The host name or IP literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns true if connections to this target use TLS.
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    fn is_default_port(&self) -> bool {
        if self.is_tls() {
            self.port == 443
        } else {
            self.port == 80
        }
    }

    fn bracketed_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host:port`, with IPv6 literals in brackets.
    pub(crate) fn authority(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    /// The value of a `Host` header for this target. The port is left out
    /// when it is the scheme's default.
    pub(crate) fn host_header(&self) -> String {
        if self.is_default_port() {
            self.bracketed_host()
        } else {
            self.authority()
        }
    }

    /// Resolves a path (and query) against this target into an absolute URI.
    pub(crate) fn resolve(&self, path_and_query: &str) -> crate::Result<Uri> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority().as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|_| crate::Error::new_user_invalid_target())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Describes a type returned by a connector.
pub trait Connection {
    /// Return metadata describing the connection.
    fn connected(&self) -> Connected;
}

/// Extra information about the connected transport.
///
/// This is used to tell the client whether ALPN selected HTTP/2.
#[derive(Clone, Debug)]
pub struct Connected {
    alpn: Alpn,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Alpn {
    H2,
    None,
}

impl Connected {
    /// Create new `Connected` type with empty metadata.
    pub fn new() -> Connected {
        Connected { alpn: Alpn::None }
    }

    /// Set that the connected transport negotiated HTTP/2 as its next protocol.
    pub fn negotiated_h2(mut self) -> Connected {
        self.alpn = Alpn::H2;
        self
    }

    /// Determines if the connected transport negotiated HTTP/2 as its next protocol.
    pub fn is_negotiated_h2(&self) -> bool {
        self.alpn == Alpn::H2
    }
}

impl Default for Connected {
    fn default() -> Connected {
        Connected::new()
    }
}

pub(super) mod sealed {
    use std::error::Error as StdError;
    use std::future::Future;
    use std::marker::Unpin;
    use std::pin::Pin;

    use futures_util::future;
    use tokio::io::{AsyncRead, AsyncWrite};

    use super::{Connection, Target};

    pub type BoxError = Box<dyn StdError + Send + Sync>;

    pub type Connecting<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;

    /// Connect to a destination, returning an IO transport.
    ///
    /// A connector receives a [`Target`] and returns a `Future` of the
    /// ready connection.
    ///
    /// # Trait Alias
    ///
    /// This is really just an *alias* for the `tower::Service` trait, with
    /// additional bounds set for convenience *inside* faultline. You don't
    /// actually implement this trait, but `tower::Service<Target>` instead.
    pub trait Connect: Sealed + Clone + Send + Sync + 'static {
        #[doc(hidden)]
        type Transport: AsyncRead + AsyncWrite + Connection + Unpin + Send + 'static;
        #[doc(hidden)]
        fn connect(&self, internal_only: Internal, dst: Target) -> Connecting<Self::Transport>;
    }

    impl<S, T> Connect for S
    where
        S: tower_service::Service<Target, Response = T> + Clone + Send + Sync + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
        T: AsyncRead + AsyncWrite + Connection + Unpin + Send + 'static,
    {
        type Transport = T;

        fn connect(&self, _: Internal, dst: Target) -> Connecting<T> {
            let mut svc = self.clone();
            Box::pin(async move {
                future::poll_fn(|cx| svc.poll_ready(cx))
                    .await
                    .map_err(Into::into)?;
                svc.call(dst).await.map_err(Into::into)
            })
        }
    }

    impl<S, T> Sealed for S
    where
        S: tower_service::Service<Target, Response = T> + Send,
        S::Error: Into<BoxError>,
        T: AsyncRead + AsyncWrite + Connection + Unpin + Send + 'static,
    {
    }

    pub trait Sealed {}
    #[allow(missing_debug_implementations)]
    pub struct Internal;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    #[test]
    fn target_from_uri_defaults_ports() {
        let http = Target::from_uri(&"http://example.com/a".parse().unwrap()).unwrap();
        assert_eq!(http, Target::http("example.com", 80));
        assert!(!http.is_tls());

        let https = Target::from_uri(&"https://example.com".parse().unwrap()).unwrap();
        assert_eq!(https.port(), 443);
        assert!(https.is_tls());
    }

    #[test]
    fn target_from_uri_keeps_explicit_port() {
        let target = Target::from_uri(&"http://127.0.0.1:8080/x?y=1".parse().unwrap()).unwrap();
        assert_eq!(target.host(), "127.0.0.1");
        assert_eq!(target.port(), 8080);
        assert_eq!(target.to_string(), "http://127.0.0.1:8080");
    }

    #[test]
    fn target_from_uri_rejects_relative_and_unknown_schemes() {
        let err = Target::from_uri(&"/path".parse().unwrap()).unwrap_err();
        assert_eq!(err.fault(), FaultKind::InvalidRequest);

        let err = Target::from_uri(&"ftp://example.com".parse().unwrap()).unwrap_err();
        assert!(err.is_user());
    }

    #[test]
    fn ipv6_targets_are_bracketed_when_formatted() {
        let target = Target::from_uri(&"http://[::1]:3000".parse().unwrap()).unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.authority(), "[::1]:3000");
        assert_eq!(target.host_header(), "[::1]:3000");
    }

    #[test]
    fn host_header_omits_default_port() {
        assert_eq!(Target::https("example.com", 443).host_header(), "example.com");
        assert_eq!(Target::http("example.com", 81).host_header(), "example.com:81");
    }

    #[test]
    fn targets_differ_by_scheme() {
        assert_ne!(Target::http("a", 8443), Target::https("a", 8443));
    }

    #[test]
    fn resolve_builds_absolute_uri() {
        let uri = Target::http("localhost", 8080).resolve("/some/path?q").unwrap();
        assert_eq!(uri, "http://localhost:8080/some/path?q");
    }

    #[test]
    fn connected_alpn() {
        assert!(!Connected::new().is_negotiated_h2());
        assert!(Connected::new().negotiated_h2().is_negotiated_h2());
    }
}
