use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Connected, Connection, Target};

/// A connector for the `http` scheme.
///
/// Resolves the target's host and then connects over TCP, trying each
/// resolved address in turn.
#[derive(Clone)]
pub struct HttpConnector {
    config: Arc<Config>,
}

#[derive(Clone)]
struct Config {
    connect_timeout: Option<Duration>,
    enforce_http: bool,
    nodelay: bool,
}

impl HttpConnector {
    /// Construct a new HttpConnector.
    pub fn new() -> HttpConnector {
        HttpConnector {
            config: Arc::new(Config {
                connect_timeout: None,
                enforce_http: true,
                nodelay: false,
            }),
        }
    }

    /// Option to enforce all `Target`s have the `http` scheme.
    ///
    /// Enabled by default.
    #[inline]
    pub fn enforce_http(&mut self, is_enforced: bool) {
        self.config_mut().enforce_http = is_enforced;
    }

    /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
    ///
    /// Default is `false`.
    #[inline]
    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.config_mut().nodelay = nodelay;
    }

    /// Set the connect timeout.
    ///
    /// The timeout applies to each resolved address separately.
    ///
    /// Default is `None`.
    #[inline]
    pub fn set_connect_timeout(&mut self, dur: Option<Duration>) {
        self.config_mut().connect_timeout = dur;
    }

    fn config_mut(&mut self) -> &mut Config {
        // If the are HttpConnector clones, this will clone the inner
        // config. So mutating the config won't ever affect previous
        // clones.
        Arc::make_mut(&mut self.config)
    }
}

impl Default for HttpConnector {
    fn default() -> HttpConnector {
        HttpConnector::new()
    }
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector").finish()
    }
}

impl tower_service::Service<Target> for HttpConnector {
    type Response = TcpStream;
    type Error = ConnectError;
    type Future = HttpConnecting;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Target) -> Self::Future {
        let config = self.config.clone();
        HttpConnecting {
            fut: Box::pin(async move { call_async(&config, dst).await }),
        }
    }
}

async fn call_async(config: &Config, dst: Target) -> Result<TcpStream, ConnectError> {
    trace!(
        "Http::connect; scheme={:?}, host={:?}, port={:?}",
        dst.scheme(),
        dst.host(),
        dst.port(),
    );

    if config.enforce_http && dst.is_tls() {
        return Err(ConnectError::new("invalid URL, scheme is not http"));
    }

    let addrs = tokio::net::lookup_host((dst.host(), dst.port()))
        .await
        .map_err(ConnectError::dns)?
        .collect::<Vec<_>>();
    debug!("resolved {} to {:?}", dst, addrs);

    let mut last_err = None;
    for addr in addrs {
        match connect(config, addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!("connect error for {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ConnectError::new("dns resolved to no addresses")))
}

async fn connect(config: &Config, addr: SocketAddr) -> Result<TcpStream, ConnectError> {
    let connecting = TcpStream::connect(addr);
    let stream = match config.connect_timeout {
        Some(dur) => match tokio::time::timeout(dur, connecting).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        },
        None => connecting.await,
    }
    .map_err(ConnectError::m("tcp connect error"))?;

    stream
        .set_nodelay(config.nodelay)
        .map_err(ConnectError::m("tcp set_nodelay error"))?;

    Ok(stream)
}

impl Connection for TcpStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// A Future representing work to connect to a URL.
#[must_use = "futures do nothing unless polled"]
pub struct HttpConnecting {
    fut: Pin<Box<dyn Future<Output = Result<TcpStream, ConnectError>> + Send>>,
}

impl Future for HttpConnecting {
    type Output = Result<TcpStream, ConnectError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        self.fut.as_mut().poll(cx)
    }
}

impl fmt::Debug for HttpConnecting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("HttpConnecting")
    }
}

/// The error type returned when a TCP connection could not be established.
pub struct ConnectError {
    msg: Box<str>,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl ConnectError {
    fn new<S>(msg: S) -> ConnectError
    where
        S: Into<Box<str>>,
    {
        ConnectError {
            msg: msg.into(),
            cause: None,
        }
    }

    fn with<S, E>(msg: S, cause: E) -> ConnectError
    where
        S: Into<Box<str>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        ConnectError {
            msg: msg.into(),
            cause: Some(cause.into()),
        }
    }

    fn dns<E>(cause: E) -> ConnectError
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        ConnectError::with("dns error", cause)
    }

    fn m<S, E>(msg: S) -> impl FnOnce(E) -> ConnectError
    where
        S: Into<Box<str>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        move |cause| ConnectError::with(msg, cause)
    }
}

impl fmt::Debug for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.cause {
            f.debug_tuple("ConnectError")
                .field(&self.msg)
                .field(cause)
                .finish()
        } else {
            self.msg.fmt(f)
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.msg)?;

        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }

        Ok(())
    }
}

impl StdError for ConnectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| &**e as _)
    }
}
