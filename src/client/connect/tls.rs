use std::convert::TryFrom;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll};

use http::Version;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::sealed::BoxError;
use super::{Connected, Connection, HttpConnector, Target};

/// TLS settings for `https` targets.
///
/// By default only certificates chaining to explicitly added roots are
/// trusted, and ALPN offers `h2` followed by `http/1.1`.
pub struct TlsConfig {
    roots: Vec<CertificateDer<'static>>,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    alpn: Vec<Version>,
    verify_host: bool,
}

impl TlsConfig {
    /// Creates a config with no trusted roots.
    pub fn new() -> TlsConfig {
        TlsConfig {
            roots: Vec::new(),
            identity: None,
            alpn: vec![Version::HTTP_2, Version::HTTP_11],
            verify_host: true,
        }
    }

    /// Trusts a DER encoded root certificate.
    pub fn add_root_certificate(mut self, cert: impl Into<CertificateDer<'static>>) -> TlsConfig {
        self.roots.push(cert.into());
        self
    }

    /// Trusts every certificate in a PEM bundle.
    pub fn add_pem_roots(mut self, pem: &[u8]) -> crate::Result<TlsConfig> {
        let mut rd = pem;
        for cert in rustls_pemfile::certs(&mut rd) {
            let cert = cert.map_err(crate::Error::new_handshake)?;
            self.roots.push(cert);
        }
        Ok(self)
    }

    /// Presents a client certificate chain and its private key.
    pub fn identity(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> TlsConfig {
        self.identity = Some((chain, key));
        self
    }

    /// The protocol versions offered over ALPN, most preferred first.
    ///
    /// Versions without an ALPN id are ignored. An empty list disables ALPN,
    /// which means HTTP/1.1.
    pub fn alpn_protocols(mut self, versions: &[Version]) -> TlsConfig {
        self.alpn = versions.to_vec();
        self
    }

    /// Sets whether the server certificate must be valid for the target's
    /// host name.
    ///
    /// Disabling this only tolerates a name mismatch. The chain must still
    /// lead to a trusted root.
    ///
    /// Default is `true`.
    pub fn verify_host(mut self, enabled: bool) -> TlsConfig {
        self.verify_host = enabled;
        self
    }

    pub(crate) fn offers_h2(&self) -> bool {
        self.alpn.contains(&Version::HTTP_2)
    }

    pub(crate) fn build(&self) -> crate::Result<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for cert in &self.roots {
            roots.add(cert.clone()).map_err(crate::Error::new_handshake)?;
        }
        let roots = Arc::new(roots);

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(crate::Error::new_handshake)?;
        let builder = if self.verify_host {
            builder.with_root_certificates(roots)
        } else {
            let verifier = IgnoreHostname::new(roots, provider)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
        };

        let mut config = match self.identity {
            Some((ref chain, ref key)) => builder
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(crate::Error::new_handshake)?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self
            .alpn
            .iter()
            .filter_map(|version| alpn_id(*version))
            .map(|id| id.to_vec())
            .collect();

        Ok(Arc::new(config))
    }
}

impl Default for TlsConfig {
    fn default() -> TlsConfig {
        TlsConfig::new()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("roots", &self.roots.len())
            .field("identity", &self.identity.is_some())
            .field("alpn", &self.alpn)
            .field("verify_host", &self.verify_host)
            .finish()
    }
}

fn alpn_id(version: Version) -> Option<&'static [u8]> {
    match version {
        Version::HTTP_2 => Some(b"h2"),
        Version::HTTP_11 => Some(b"http/1.1"),
        _ => None,
    }
}

/// Full chain verification that tolerates a certificate issued for another
/// name.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl IgnoreHostname {
    fn new(roots: Arc<RootCertStore>, provider: Arc<CryptoProvider>) -> crate::Result<IgnoreHostname> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(crate::Error::new_handshake)?;
        Ok(IgnoreHostname { inner })
    }
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))
            | Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext {
                ..
            })) => {
                trace!("ignoring certificate name mismatch for {:?}", server_name);
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// A connector that adds TLS on top of another connector for `https`
/// targets, and passes `http` targets through untouched.
#[derive(Clone)]
pub struct HttpsConnector<T> {
    inner: T,
    tls: Option<Arc<ClientConfig>>,
}

impl HttpsConnector<HttpConnector> {
    /// A connector without TLS settings. Connecting to an `https` target
    /// fails with a handshake error.
    pub fn new() -> HttpsConnector<HttpConnector> {
        HttpsConnector {
            inner: Self::tcp(),
            tls: None,
        }
    }

    /// A connector using the given TLS settings.
    pub fn with_tls(tls: &TlsConfig) -> crate::Result<HttpsConnector<HttpConnector>> {
        Ok(HttpsConnector {
            inner: Self::tcp(),
            tls: Some(tls.build()?),
        })
    }

    fn tcp() -> HttpConnector {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http
    }
}

impl<T> HttpsConnector<T> {
    /// Wraps an existing connector.
    pub fn from_parts(inner: T, tls: Option<Arc<ClientConfig>>) -> HttpsConnector<T> {
        HttpsConnector { inner, tls }
    }

    /// Mutable access to the wrapped connector.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for HttpsConnector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpsConnector")
            .field("inner", &self.inner)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

type HttpsConnecting<T> = Pin<Box<dyn Future<Output = Result<MaybeTlsStream<T>, BoxError>> + Send>>;

impl<T> tower_service::Service<Target> for HttpsConnector<T>
where
    T: tower_service::Service<Target>,
    T::Response: AsyncRead + AsyncWrite + Connection + Unpin + Send + 'static,
    T::Error: Into<BoxError>,
    T::Future: Send + 'static,
{
    type Response = MaybeTlsStream<T::Response>;
    type Error = BoxError;
    type Future = HttpsConnecting<T::Response>;

    fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Target) -> Self::Future {
        let is_tls = dst.is_tls();
        let host = dst.host().to_owned();
        let tls = self.tls.clone();
        let connecting = self.inner.call(dst);

        Box::pin(async move {
            let io = connecting.await.map_err(Into::into)?;
            if !is_tls {
                return Ok(MaybeTlsStream::Plain(io));
            }

            let config = tls.ok_or_else(|| HandshakeError::new("https target, but no TLS configured"))?;
            let server_name = ServerName::try_from(host)
                .map_err(|e| HandshakeError::with("invalid server name", e))?;
            trace!("starting TLS handshake with {:?}", server_name);
            let stream = TlsConnector::from(config)
                .connect(server_name, io)
                .await
                .map_err(|e| HandshakeError::with("TLS handshake failed", e))?;
            debug!(
                "TLS handshake complete, alpn={:?}",
                stream.get_ref().1.alpn_protocol().map(String::from_utf8_lossy)
            );
            Ok(MaybeTlsStream::Tls(Box::new(stream)))
        })
    }
}

/// A transport that is either plaintext or TLS.
pub enum MaybeTlsStream<T> {
    /// A plaintext transport.
    Plain(T),
    /// A transport with a completed TLS handshake.
    Tls(Box<TlsStream<T>>),
}

impl<T> fmt::Debug for MaybeTlsStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeTlsStream::Plain(_) => f.pad("MaybeTlsStream::Plain"),
            MaybeTlsStream::Tls(_) => f.pad("MaybeTlsStream::Tls"),
        }
    }
}

impl<T: Connection + AsyncRead + AsyncWrite + Unpin> Connection for MaybeTlsStream<T> {
    fn connected(&self) -> Connected {
        match self {
            MaybeTlsStream::Plain(io) => io.connected(),
            MaybeTlsStream::Tls(tls) => {
                let (io, session) = tls.get_ref();
                let connected = io.connected();
                if session.alpn_protocol() == Some(&b"h2"[..]) {
                    connected.negotiated_h2()
                } else {
                    connected
                }
            }
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            MaybeTlsStream::Plain(io) => Pin::new(io).poll_read(cx, buf),
            MaybeTlsStream::Tls(tls) => Pin::new(&mut **tls).poll_read(cx, buf),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::get_mut(self) {
            MaybeTlsStream::Plain(io) => Pin::new(io).poll_write(cx, buf),
            MaybeTlsStream::Tls(tls) => Pin::new(&mut **tls).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            MaybeTlsStream::Plain(io) => Pin::new(io).poll_flush(cx),
            MaybeTlsStream::Tls(tls) => Pin::new(&mut **tls).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            MaybeTlsStream::Plain(io) => Pin::new(io).poll_shutdown(cx),
            MaybeTlsStream::Tls(tls) => Pin::new(&mut **tls).poll_shutdown(cx),
        }
    }
}

/// The error type returned when TLS could not be set up on a transport.
pub struct HandshakeError {
    msg: &'static str,
    cause: Option<BoxError>,
}

impl HandshakeError {
    fn new(msg: &'static str) -> HandshakeError {
        HandshakeError { msg, cause: None }
    }

    fn with<E: Into<BoxError>>(msg: &'static str, cause: E) -> HandshakeError {
        HandshakeError {
            msg,
            cause: Some(cause.into()),
        }
    }
}

impl fmt::Debug for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("HandshakeError");
        f.field(&self.msg);
        if let Some(ref cause) = self.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.msg)?;
        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for HandshakeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| &**e as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_ids_follow_preference_order() {
        let config = TlsConfig::new()
            .alpn_protocols(&[Version::HTTP_11, Version::HTTP_2])
            .build()
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec(), b"h2".to_vec()]);
    }

    #[test]
    fn versions_without_alpn_id_are_skipped() {
        let config = TlsConfig::new()
            .alpn_protocols(&[Version::HTTP_10, Version::HTTP_11])
            .build()
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn pem_roots_are_loaded() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let pem = cert.cert.pem();

        let config = TlsConfig::new().add_pem_roots(pem.as_bytes()).unwrap();
        assert_eq!(config.roots.len(), 1);
        assert!(config.build().is_ok());
    }

    #[test]
    fn garbage_root_is_rejected() {
        let err = TlsConfig::new()
            .add_root_certificate(CertificateDer::from(vec![1, 2, 3]))
            .build()
            .unwrap_err();
        assert!(err.is_handshake());
    }

    #[test]
    fn relaxed_host_verification_builds() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let config = TlsConfig::new()
            .add_root_certificate(cert.cert.der().clone())
            .verify_host(false)
            .build();
        assert!(config.is_ok());
    }

    #[tokio::test]
    async fn https_without_tls_config_is_a_handshake_error() {
        use tower_service::Service;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut connector = HttpsConnector::new();
        let err = connector
            .call(Target::https("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(err.is::<HandshakeError>());
    }
}
