//! HTTP/1.1 client connections

use bytes::Bytes;
use http::Request;
use tokio::io::{AsyncRead, AsyncWrite};

use super::super::dispatch;
use crate::common::{exec::Exec, task, Future, Poll};
use crate::proto::{self, Exchange};

/// The sender side of an established connection.
pub(crate) struct SendRequest {
    dispatch: dispatch::Sender<Request<Bytes>, Exchange>,
}

/// Spawns the task driving `io` on `exec` and returns its sender.
pub(crate) fn handshake<T>(io: T, exec: &Exec) -> SendRequest
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = dispatch::channel();
    exec.execute(proto::h1::dispatch::run(io, rx));
    SendRequest { dispatch: tx }
}

// ===== impl SendRequest

impl SendRequest {
    /// Polls to determine whether this sender can be used yet for a request.
    ///
    /// If the associated connection is closed, this returns an Error.
    pub(crate) fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> Poll<crate::Result<()>> {
        self.dispatch.poll_ready(cx)
    }

    /// Waits until the dispatcher is ready
    pub(crate) async fn ready(&mut self) -> crate::Result<()> {
        futures_util::future::poll_fn(|cx| self.poll_ready(cx)).await
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.dispatch.is_closed()
    }

    /// Whether the connection finished its last exchange and can take
    /// another request right away.
    pub(crate) fn is_ready(&self) -> bool {
        self.dispatch.is_ready()
    }

    /// Sends a request over the connection.
    ///
    /// The connection must be ready, see `ready`.
    pub(crate) fn send_request(
        &mut self,
        req: Request<Bytes>,
    ) -> impl Future<Output = crate::Result<Exchange>> {
        let sent = self.dispatch.send(req);

        async move {
            match sent {
                Ok(rx) => match rx.await {
                    Ok(result) => result,
                    // the callback always answers, even when dropped
                    Err(_canceled) => Err(crate::Error::new_canceled()),
                },
                Err(_req) => {
                    tracing::debug!("connection was not ready");
                    Err(crate::Error::new_closed().with("connection was not ready"))
                }
            }
        }
    }
}

impl std::fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendRequest").finish()
    }
}
