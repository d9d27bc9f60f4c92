#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;

pub use faultline::http::{Method, StatusCode, Version};
pub use faultline::{Client, ConnectionInfo, FaultKind, Target, TlsConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the mock server does with a request for a stubbed path.
#[derive(Clone, Debug)]
pub struct Reply {
    status: u16,
    body: &'static str,
    delay: Option<Duration>,
    fault: bool,
    hangup: bool,
}

impl Reply {
    pub fn ok(body: &'static str) -> Reply {
        Reply {
            status: 200,
            body,
            delay: None,
            fault: false,
            hangup: false,
        }
    }

    /// Hang up without a response: the socket is closed on HTTP/1.1, the
    /// stream is reset on HTTP/2.
    pub fn empty() -> Reply {
        Reply {
            status: 0,
            body: "",
            delay: None,
            fault: true,
            hangup: false,
        }
    }

    /// Close the whole connection without a response, on either protocol.
    pub fn hangup() -> Reply {
        Reply {
            status: 0,
            body: "",
            delay: None,
            fault: true,
            hangup: true,
        }
    }

    /// Wait before replying, or before the fault when there is one.
    pub fn delay(mut self, delay: Duration) -> Reply {
        self.delay = Some(delay);
        self
    }
}

#[derive(Clone, Copy, Debug)]
enum Protocol {
    Http1,
    H2c,
    Tls(&'static [&'static [u8]]),
}

pub struct ServerBuilder {
    stubs: HashMap<String, Reply>,
    protocol: Protocol,
}

impl ServerBuilder {
    pub fn stub(mut self, path: &str, reply: Reply) -> ServerBuilder {
        self.stubs.insert(path.to_owned(), reply);
        self
    }

    pub fn http1(mut self) -> ServerBuilder {
        self.protocol = Protocol::Http1;
        self
    }

    /// HTTP/2 over plaintext, prior knowledge only.
    pub fn h2c(mut self) -> ServerBuilder {
        self.protocol = Protocol::H2c;
        self
    }

    /// TLS for `localhost`, selecting from `alpn` in order of preference.
    pub fn tls(mut self, alpn: &'static [&'static [u8]]) -> ServerBuilder {
        self.protocol = Protocol::Tls(alpn);
        self
    }

    pub async fn start(self) -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let state = Arc::new(State {
            stubs: self.stubs,
            counts: Mutex::new(HashMap::new()),
            unmatched: Mutex::new(Vec::new()),
        });

        let (acceptor, cert) = match self.protocol {
            Protocol::Tls(alpn) => {
                let (acceptor, cert) = tls_acceptor(alpn);
                (Some(acceptor), Some(cert))
            }
            _ => (None, None),
        };

        let protocol = self.protocol;
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let state = accept_state.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match (protocol, acceptor) {
                        (Protocol::Http1, _) => serve_h1(tcp, state).await,
                        (Protocol::H2c, _) => serve_h2(tcp, state).await,
                        (Protocol::Tls(_), Some(acceptor)) => {
                            let tls = match acceptor.accept(tcp).await {
                                Ok(tls) => tls,
                                // the client gave up on the handshake
                                Err(_) => return,
                            };
                            let is_h2 = tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
                            if is_h2 {
                                serve_h2(tls, state).await
                            } else {
                                serve_h1(tls, state).await
                            }
                        }
                        (Protocol::Tls(_), None) => unreachable!("tls without acceptor"),
                    }
                });
            }
        });

        Server { addr, state, cert }
    }
}

pub struct Server {
    addr: SocketAddr,
    state: Arc<State>,
    cert: Option<CertificateDer<'static>>,
}

impl Server {
    /// A builder for an HTTP/1.1 server, see `h2c` and `tls` for others.
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            stubs: HashMap::new(),
            protocol: Protocol::Http1,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The target to point a client at; `https://localhost` when serving TLS.
    pub fn target(&self) -> Target {
        if self.cert.is_some() {
            Target::https("localhost", self.port())
        } else {
            Target::http("127.0.0.1", self.port())
        }
    }

    /// The self-signed certificate served over TLS.
    pub fn certificate(&self) -> CertificateDer<'static> {
        self.cert.clone().expect("server is not serving TLS")
    }

    /// How many requests arrived for `path`.
    pub fn count(&self, path: &str) -> usize {
        self.state
            .counts
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Paths requested that had no stub.
    pub fn unmatched(&self) -> Vec<String> {
        self.state.unmatched.lock().unwrap().clone()
    }
}

struct State {
    stubs: HashMap<String, Reply>,
    counts: Mutex<HashMap<String, usize>>,
    unmatched: Mutex<Vec<String>>,
}

impl State {
    fn reply_for(&self, path: &str) -> Option<Reply> {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_insert(0) += 1;
        let reply = self.stubs.get(path).cloned();
        if reply.is_none() {
            self.unmatched.lock().unwrap().push(path.to_owned());
        }
        reply
    }
}

fn tls_acceptor(alpn: &[&[u8]]) -> (TlsAcceptor, CertificateDer<'static>) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("self-signed cert");
    let cert = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .expect("server cert");
    config.alpn_protocols = alpn.iter().map(|id| id.to_vec()).collect();

    (TlsAcceptor::from(Arc::new(config)), cert)
}

async fn serve_h1<T>(mut io: T, state: Arc<State>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let (path, body_len) = loop {
            if let Some((path, body_len, consumed)) = parse_request(&buf) {
                buf.advance(consumed);
                break (path, body_len);
            }
            match io.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => (),
            }
        };
        while buf.len() < body_len {
            match io.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => (),
            }
        }
        buf.advance(body_len);

        let (status, body) = match state.reply_for(&path) {
            Some(reply) => {
                if let Some(delay) = reply.delay {
                    tokio::time::sleep(delay).await;
                }
                if reply.fault {
                    return;
                }
                (reply.status, reply.body)
            }
            None => (404, ""),
        };
        let res = format!(
            "HTTP/1.1 {} {}\r\ncontent-length: {}\r\n\r\n{}",
            status,
            StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or(""),
            body.len(),
            body
        );
        if io.write_all(res.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn parse_request(buf: &[u8]) -> Option<(String, usize, usize)> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let path = req.path.unwrap_or("/").to_owned();
            let body_len = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            Some((path, body_len, consumed))
        }
        _ => None,
    }
}

async fn serve_h2<T>(io: T, state: Arc<State>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = match h2::server::handshake(io).await {
        Ok(conn) => conn,
        Err(_) => return,
    };
    let hangup = Arc::new(Notify::new());
    loop {
        let accepted = tokio::select! {
            // checked first, so nothing queued by the stream tasks gets out
            biased;
            _ = hangup.notified() => return,
            accepted = conn.accept() => accepted,
        };
        let (req, mut respond) = match accepted {
            Some(Ok(accepted)) => accepted,
            Some(Err(_)) | None => return,
        };
        let state = state.clone();
        let hangup = hangup.clone();
        tokio::spawn(async move {
            let (status, body) = match state.reply_for(req.uri().path()) {
                Some(reply) => {
                    if let Some(delay) = reply.delay {
                        tokio::time::sleep(delay).await;
                    }
                    if reply.hangup {
                        hangup.notify_one();
                        return;
                    }
                    if reply.fault {
                        respond.send_reset(h2::Reason::INTERNAL_ERROR);
                        return;
                    }
                    (reply.status, reply.body)
                }
                None => (404, ""),
            };
            let res = faultline::http::Response::builder()
                .status(status)
                .body(())
                .expect("response");
            if let Ok(mut send) = respond.send_response(res, body.is_empty()) {
                if !body.is_empty() {
                    let _ = send.send_data(Bytes::from_static(body.as_bytes()), true);
                }
            }
        });
    }
}
