//! HTTP Client
//!
//! The [`Client`] pools connections per [`Target`], negotiates HTTP/1.1 or
//! HTTP/2 for each new connection, and keeps a fault on one request from
//! spilling over onto any other. A request that fails resolves with an
//! [`Error`](crate::Error) whose [`fault()`](crate::Error::fault) says what
//! happened; the connection it ran on is evicted from the pool only when
//! the fault can have damaged it.
//!
//! ## Example
//!
//! ```no_run
//! use faultline::http::{Method, StatusCode};
//! use faultline::{Client, Target};
//!
//! # async fn run() -> faultline::Result<()> {
//! let client = Client::builder()
//!     .default_target(Target::http("localhost", 8080))
//!     .build()?;
//!
//! let res = client.send(Method::GET, "/some/path").await?;
//! assert_eq!(res.status(), StatusCode::OK);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{Entry, HeaderValue, HOST};
use http::{Method, Request, Response, Uri, Version};
use tracing::{debug, trace, warn};

use self::connect::sealed::{Connect, Internal};
use self::connect::{Connection, HandshakeError, HttpConnector, HttpsConnector, Target, TlsConfig};
use self::fault::Isolation;
use self::pool::{Acquired, Pool, Poolable, Pooled, Reservation, Ticket};
use crate::common::{exec::Exec, task, Future, Pin, Poll};
use crate::proto::Exchange;
use crate::rt::{BoxSendFuture, Executor};

pub use self::pool::{ConnState, ConnectionInfo};

pub(crate) mod conn;
pub mod connect;
pub(crate) mod dispatch;
pub(crate) mod fault;
mod pool;

/// A Client to make outgoing HTTP requests.
///
/// `Client` is cheap to clone and cloning is the recommended way to share a
/// `Client`. The underlying connection pool will be reused.
pub struct Client<C = HttpsConnector<HttpConnector>> {
    config: Config,
    connector: C,
    exec: Exec,
    h2_builder: conn::http2::Config,
    pool: Pool<PoolClient>,
}

#[derive(Clone, Debug)]
struct Config {
    // Whether TLS connections may negotiate HTTP/2.
    alpn_h2: bool,
    default_target: Option<Target>,
    http2_only: bool,
    retry_canceled_requests: bool,
    set_host: bool,
}

/// A `Future` that will resolve to an HTTP Response.
///
/// This is returned by `Client::request` (and `Client::get`).
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    inner: Pin<Box<dyn Future<Output = crate::Result<Response<Bytes>>> + Send>>,
}

// ===== impl Client =====

impl Client {
    /// Create a new Client with the default config.
    ///
    /// The default client has no TLS settings, so requests to `https`
    /// targets fail with [`FaultKind::HandshakeFailure`](crate::FaultKind).
    pub fn new() -> Client {
        Builder::default().build_with_connector(HttpsConnector::new())
    }

    /// Create a builder to configure a new `Client`.
    pub fn builder() -> Builder {
        Builder::default()
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl<C> Client<C>
where
    C: Connect,
{
    /// Send a `GET` request to the supplied `Uri`.
    pub fn get(&self, uri: Uri) -> ResponseFuture {
        let mut req = Request::new(Bytes::new());
        *req.uri_mut() = uri;
        self.request(req)
    }

    /// Send a bodiless request for `path` to the client's default target.
    ///
    /// See [`Builder::default_target`].
    pub fn send(&self, method: Method, path: &str) -> ResponseFuture {
        let uri = match path.parse::<Uri>() {
            Ok(uri) => uri,
            Err(err) => {
                debug!("invalid request path {:?}: {}", path, err);
                return ResponseFuture::error(crate::Error::new_user_invalid_target());
            }
        };
        let mut req = Request::new(Bytes::new());
        *req.method_mut() = method;
        *req.uri_mut() = uri;
        self.request(req)
    }

    /// Send a constructed `Request` using this `Client`.
    ///
    /// The URI must be absolute, unless the client has a default target, in
    /// which case its path and query are resolved against that target.
    pub fn request(&self, req: Request<Bytes>) -> ResponseFuture {
        match req.version() {
            Version::HTTP_10 | Version::HTTP_11 | Version::HTTP_2 => (),
            other => {
                warn!("Request has unsupported version \"{:?}\"", other);
                return ResponseFuture::error(crate::Error::new_user_unsupported_version());
            }
        }

        let client = self.clone();
        ResponseFuture::new(async move { client.send_request(req).await })
    }

    /// Snapshots of the idle connections pooled for `target`.
    pub fn idle_connections(&self, target: &Target) -> Vec<ConnectionInfo> {
        self.pool.idle(target)
    }

    /// Snapshots of every live connection to `target`, in creation order.
    pub fn connections(&self, target: &Target) -> Vec<ConnectionInfo> {
        self.pool.connections(target)
    }

    async fn send_request(self, mut req: Request<Bytes>) -> crate::Result<Response<Bytes>> {
        let target = self.target_for(&mut req)?;
        loop {
            let mut pooled = self.connection_for(&target).await?;

            if let Err(err) = pooled.ready().await {
                // The request was never handed to this connection, so asking
                // for another one is not a retry of a sent request.
                pooled.mark_unhealthy();
                if self.config.retry_canceled_requests && pooled.is_reused() {
                    trace!(
                        "connection {} was closed before use, trying another: {}",
                        pooled.info().id(),
                        err
                    );
                    continue;
                }
                return Err(err);
            }

            return self.send_on(pooled, req, &target).await;
        }
    }

    async fn send_on(
        &self,
        mut pooled: Pooled<PoolClient>,
        mut req: Request<Bytes>,
        target: &Target,
    ) -> crate::Result<Response<Bytes>> {
        if pooled.is_http1() && self.config.set_host {
            if let Entry::Vacant(entry) = req.headers_mut().entry(HOST) {
                let host = HeaderValue::from_str(&target.host_header())
                    .map_err(|_| crate::Error::new_user_invalid_target())?;
                entry.insert(host);
            }
        }

        let id = pooled.info().id();
        trace!("sending {} {} on connection {}", req.method(), req.uri(), id);
        match pooled.send_request(req).await {
            Ok(exchange) => {
                if !exchange.reusable {
                    trace!("connection {} can't be reused", id);
                    pooled.mark_unhealthy();
                }
                let info = pooled.info().with_stream_id(exchange.stream_id);
                let mut res = exchange.res;
                res.extensions_mut().insert(info);
                Ok(res)
            }
            Err(err) => {
                match err.isolation() {
                    Isolation::EvictConnection => {
                        debug!("evicting connection {} after error: {}", id, err);
                        pooled.mark_unhealthy();
                    }
                    Isolation::ResetStream => {
                        debug!("stream on connection {} failed: {}", id, err);
                    }
                    Isolation::None => (),
                }
                Err(err)
            }
        }
    }

    fn target_for(&self, req: &mut Request<Bytes>) -> crate::Result<Target> {
        let uri = req.uri();
        if uri.scheme().is_some() || uri.authority().is_some() {
            return Target::from_uri(uri);
        }
        match self.config.default_target {
            Some(ref target) => {
                let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
                let absolute = target.resolve(path)?;
                *req.uri_mut() = absolute;
                Ok(target.clone())
            }
            None => {
                debug!("relative URI {} and no default target", uri);
                Err(crate::Error::new_user_absolute_uri_required())
            }
        }
    }

    async fn connection_for(&self, target: &Target) -> crate::Result<Pooled<PoolClient>> {
        match self.pool.acquire(target, self.may_share(target)).await? {
            Acquired::Reused(pooled) => {
                trace!("reusing connection {} to {}", pooled.info().id(), target);
                Ok(pooled)
            }
            Acquired::Connect(ticket) => self.connect_to(ticket).await,
        }
    }

    // Whether a new connection to `target` could end up multiplexed.
    fn may_share(&self, target: &Target) -> bool {
        if target.is_tls() {
            self.config.alpn_h2
        } else {
            self.config.http2_only
        }
    }

    async fn connect_to(&self, ticket: Ticket<PoolClient>) -> crate::Result<Pooled<PoolClient>> {
        let target = ticket.target().clone();
        debug!("connecting to {} (connection {})", target, ticket.id());

        let io = self
            .connector
            .connect(Internal, target.clone())
            .await
            .map_err(|err| {
                debug!("connect to {} failed: {}", target, err);
                if err.is::<HandshakeError>() {
                    crate::Error::new_handshake(err)
                } else {
                    crate::Error::new_connect(err)
                }
            })?;

        let connected = io.connected();
        let is_h2 = connected.is_negotiated_h2() || (self.config.http2_only && !target.is_tls());
        let (tx, version) = if is_h2 {
            trace!("handshaking HTTP/2 with {}", target);
            let tx = conn::http2::handshake(io, &self.h2_builder, &self.exec).await?;
            (PoolTx::Http2(tx), Version::HTTP_2)
        } else {
            trace!("using HTTP/1.1 with {}", target);
            let tx = conn::http1::handshake(io, &self.exec);
            (PoolTx::Http1(tx), Version::HTTP_11)
        };

        // dropping the ticket on any error above gives the slot back
        Ok(self.pool.pooled(ticket, PoolClient { tx }, version))
    }
}

impl<C> tower_service::Service<Request<Bytes>> for Client<C>
where
    C: Connect,
{
    type Response = Response<Bytes>;
    type Error = crate::Error;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Bytes>) -> Self::Future {
        self.request(req)
    }
}

impl<C> tower_service::Service<Request<Bytes>> for &'_ Client<C>
where
    C: Connect,
{
    type Response = Response<Bytes>;
    type Error = crate::Error;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Bytes>) -> Self::Future {
        self.request(req)
    }
}

impl<C: Clone> Clone for Client<C> {
    fn clone(&self) -> Client<C> {
        Client {
            config: self.config.clone(),
            connector: self.connector.clone(),
            exec: self.exec.clone(),
            h2_builder: self.h2_builder.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<C> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish()
    }
}

// ===== impl ResponseFuture =====

impl ResponseFuture {
    fn new<F>(value: F) -> Self
    where
        F: Future<Output = crate::Result<Response<Bytes>>> + Send + 'static,
    {
        Self {
            inner: Box::pin(value),
        }
    }

    fn error(err: crate::Error) -> Self {
        Self::new(async move { Err(err) })
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Future<Response>")
    }
}

impl Future for ResponseFuture {
    type Output = crate::Result<Response<Bytes>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

// ===== impl PoolClient =====

struct PoolClient {
    tx: PoolTx,
}

enum PoolTx {
    Http1(conn::http1::SendRequest),
    Http2(conn::http2::SendRequest),
}

impl PoolClient {
    async fn ready(&mut self) -> crate::Result<()> {
        match self.tx {
            PoolTx::Http1(ref mut tx) => tx.ready().await,
            PoolTx::Http2(ref mut tx) => tx.ready().await,
        }
    }

    fn is_http1(&self) -> bool {
        matches!(self.tx, PoolTx::Http1(_))
    }

    async fn send_request(&mut self, req: Request<Bytes>) -> crate::Result<Exchange> {
        match self.tx {
            PoolTx::Http1(ref mut tx) => tx.send_request(req).await,
            PoolTx::Http2(ref mut tx) => tx.send_request(req).await,
        }
    }
}

impl Poolable for PoolClient {
    fn is_open(&self) -> bool {
        match self.tx {
            // still busy with an exchange whose caller went away
            PoolTx::Http1(ref tx) => !tx.is_closed() && tx.is_ready(),
            PoolTx::Http2(ref tx) => !tx.is_closed(),
        }
    }

    fn reserve(self) -> Reservation<Self> {
        match self.tx {
            PoolTx::Http1(tx) => Reservation::Unique(PoolClient {
                tx: PoolTx::Http1(tx),
            }),
            PoolTx::Http2(tx) => {
                let b = PoolClient {
                    tx: PoolTx::Http2(tx.clone()),
                };
                let a = PoolClient {
                    tx: PoolTx::Http2(tx),
                };
                Reservation::Shared(a, b)
            }
        }
    }

    fn can_share(&self) -> bool {
        matches!(self.tx, PoolTx::Http2(_))
    }
}

// ===== impl Builder =====

/// A builder to configure a new [`Client`](Client).
///
/// # Example
///
/// ```
/// # async fn run() -> faultline::Result<()> {
/// use std::time::Duration;
/// use faultline::Client;
///
/// let client = Client::builder()
///     .pool_idle_timeout(Duration::from_secs(30))
///     .pool_max_connections_per_target(2)
///     .http2_only(true)
///     .build()?;
/// # drop(client);
/// # Ok(())
/// # }
/// # fn main() {}
/// ```
pub struct Builder {
    client_config: Config,
    connect_timeout: Option<Duration>,
    exec: Exec,
    h2_builder: conn::http2::Config,
    pool_config: pool::Config,
    tls: Option<TlsConfig>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            client_config: Config {
                alpn_h2: false,
                default_target: None,
                http2_only: false,
                retry_canceled_requests: true,
                set_host: true,
            },
            connect_timeout: None,
            exec: Exec::Default,
            h2_builder: Default::default(),
            pool_config: pool::Config {
                idle_timeout: Some(Duration::from_secs(90)),
                max_per_target: 5,
                max_streams: 100,
            },
            tls: None,
        }
    }
}

impl Builder {
    /// Set an optional timeout for idle sockets being kept-alive.
    ///
    /// Pass `None` to disable timeout.
    ///
    /// Default is 90 seconds.
    pub fn pool_idle_timeout<D>(&mut self, val: D) -> &mut Self
    where
        D: Into<Option<Duration>>,
    {
        self.pool_config.idle_timeout = val.into();
        self
    }

    /// Sets the maximum number of connections, idle or in use, kept open to
    /// any one target. A request beyond the limit waits for a connection to
    /// be released or closed.
    ///
    /// Values below 1 are treated as 1.
    ///
    /// Default is 5.
    pub fn pool_max_connections_per_target(&mut self, max: usize) -> &mut Self {
        self.pool_config.max_per_target = max.max(1);
        self
    }

    /// Set whether the connection **must** use HTTP/2.
    ///
    /// Plaintext targets then speak HTTP/2 with prior knowledge. `https`
    /// targets always follow what ALPN negotiated.
    ///
    /// Default is false.
    pub fn http2_only(&mut self, val: bool) -> &mut Self {
        self.client_config.http2_only = val;
        self
    }

    /// Sets how many requests may share one HTTP/2 connection at a time
    /// before another connection is opened.
    ///
    /// Values below 1 are treated as 1.
    ///
    /// Default is 100.
    pub fn http2_max_concurrent_streams(&mut self, max: usize) -> &mut Self {
        self.pool_config.max_streams = max.max(1);
        self
    }

    /// Sets the [`SETTINGS_INITIAL_WINDOW_SIZE`][spec] option for HTTP2
    /// stream-level flow control.
    ///
    /// Passing `None` will do nothing.
    ///
    /// If not set, faultline will use a default.
    ///
    /// [spec]: https://http2.github.io/http2-spec/#SETTINGS_INITIAL_WINDOW_SIZE
    pub fn http2_initial_stream_window_size(&mut self, sz: impl Into<Option<u32>>) -> &mut Self {
        if let Some(sz) = sz.into() {
            self.h2_builder.initial_stream_window_size = sz;
        }
        self
    }

    /// Sets the max connection-level flow control for HTTP2
    ///
    /// Passing `None` will do nothing.
    ///
    /// If not set, faultline will use a default.
    pub fn http2_initial_connection_window_size(
        &mut self,
        sz: impl Into<Option<u32>>,
    ) -> &mut Self {
        if let Some(sz) = sz.into() {
            self.h2_builder.initial_conn_window_size = sz;
        }
        self
    }

    /// Sets the maximum frame size to use for HTTP2.
    ///
    /// Passing `None` will do nothing.
    ///
    /// If not set, faultline will use a default.
    pub fn http2_max_frame_size(&mut self, sz: impl Into<Option<u32>>) -> &mut Self {
        if let Some(sz) = sz.into() {
            self.h2_builder.max_frame_size = sz;
        }
        self
    }

    /// Set whether to retry requests that get disrupted before ever starting
    /// to write.
    ///
    /// This means a request that is given an idle, reused connection, and
    /// then encounters an error immediately as the idle connection was found
    /// to be unusable.
    ///
    /// When this is set to `false`, the related `ResponseFuture` would instead
    /// resolve to a [`FaultKind::Cancelled`](crate::FaultKind) error.
    ///
    /// Default is `true`.
    pub fn retry_canceled_requests(&mut self, val: bool) -> &mut Self {
        self.client_config.retry_canceled_requests = val;
        self
    }

    /// Set whether to automatically add the `Host` header to requests.
    ///
    /// If true, and a request does not include a `Host` header, one will be
    /// added automatically, derived from the request's target. Only
    /// HTTP/1.1 requests carry it; HTTP/2 uses the `:authority` of the URI.
    ///
    /// Default is `true`.
    pub fn set_host(&mut self, val: bool) -> &mut Self {
        self.client_config.set_host = val;
        self
    }

    /// Set the connect timeout, applied to each resolved address.
    ///
    /// Default is `None`. Only the built-in connector honors it.
    pub fn connect_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.connect_timeout = dur;
        self
    }

    /// Set the TLS settings used for `https` targets.
    ///
    /// Only the built-in connector honors it.
    pub fn tls(&mut self, tls: TlsConfig) -> &mut Self {
        self.tls = Some(tls);
        self
    }

    /// Set the target that relative request URIs are sent to.
    pub fn default_target(&mut self, target: Target) -> &mut Self {
        self.client_config.default_target = Some(target);
        self
    }

    /// Provide an executor to execute background `Connection` tasks.
    pub fn executor<E>(&mut self, exec: E) -> &mut Self
    where
        E: Executor<BoxSendFuture> + Send + Sync + 'static,
    {
        self.exec = Exec::Executor(Arc::new(exec));
        self
    }

    /// Build a client with this configuration and the default
    /// `HttpsConnector`.
    ///
    /// Fails if the TLS settings can't be turned into a rustls config.
    pub fn build(&self) -> crate::Result<Client> {
        let (mut connector, alpn_h2) = match self.tls {
            Some(ref tls) => (HttpsConnector::with_tls(tls)?, tls.offers_h2()),
            None => (HttpsConnector::new(), false),
        };
        connector.inner_mut().set_connect_timeout(self.connect_timeout);
        let mut client = self.build_with_connector(connector);
        client.config.alpn_h2 = alpn_h2;
        Ok(client)
    }

    /// Combine the configuration of this builder with a connector to create a `Client`.
    pub fn build_with_connector<C>(&self, connector: C) -> Client<C>
    where
        C: Connect,
    {
        Client {
            config: self.client_config.clone(),
            connector,
            exec: self.exec.clone(),
            h2_builder: self.h2_builder.clone(),
            pool: Pool::new(self.pool_config, self.exec.clone()),
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("client_config", &self.client_config)
            .field("connect_timeout", &self.connect_timeout)
            .field("pool_config", &self.pool_config)
            .field("tls", &self.tls)
            .finish()
    }
}
