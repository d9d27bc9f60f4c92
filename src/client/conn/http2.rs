//! HTTP/2 client connections

use std::fmt;

use bytes::Bytes;
use http::Request;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::common::{exec::Exec, task, Poll};
use crate::proto::{self, Exchange};

pub(crate) use crate::proto::h2::client::Config;

/// The sender side of an established connection.
///
/// Every clone opens its own streams on the same connection.
#[derive(Clone)]
pub(crate) struct SendRequest {
    tx: proto::h2::client::ClientTx,
}

/// Runs the HTTP/2 handshake over `io` and spawns the connection task on
/// `exec`.
pub(crate) async fn handshake<T>(io: T, config: &Config, exec: &Exec) -> crate::Result<SendRequest>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tx = proto::h2::client::handshake(io, config, exec)
        .await
        .map_err(|err| {
            debug!("http2 handshake failed: {}", err);
            crate::Error::new_handshake(err)
        })?;
    Ok(SendRequest { tx })
}

// ===== impl SendRequest

impl SendRequest {
    /// Polls until the connection accepts another stream.
    pub(crate) fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> Poll<crate::Result<()>> {
        if self.is_closed() {
            return Poll::Ready(Err(crate::Error::new_closed()));
        }
        self.tx.poll_ready(cx)
    }

    pub(crate) async fn ready(&mut self) -> crate::Result<()> {
        futures_util::future::poll_fn(|cx| self.poll_ready(cx)).await
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sends a request on a new stream.
    pub(crate) async fn send_request(&mut self, req: Request<Bytes>) -> crate::Result<Exchange> {
        self.tx.send(req).await
    }
}

impl fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRequest").finish()
    }
}
