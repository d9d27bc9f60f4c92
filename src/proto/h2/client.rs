use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_channel::mpsc;
use futures_util::future::{self, Either, FutureExt as _};
use futures_util::stream::StreamExt as _;
use h2::client::{Builder, SendRequest};
use h2::SendStream;
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::client::fault::Detector;
use crate::common::{exec::Exec, task, Future, Never, Poll};
use crate::proto::Exchange;

/// An mpsc channel is used to help notify the `Connection` task when *all*
/// other handles to it have been dropped, so that it can shutdown.
type ConnDropRef = mpsc::Sender<Never>;

// Our defaults are chosen for the "majority" case, which usually are not
// resource constrained, and so the protocol default of 64kb can be too
// limiting for performance.
const DEFAULT_CONN_WINDOW: u32 = 1024 * 1024 * 5; // 5mb
const DEFAULT_STREAM_WINDOW: u32 = 1024 * 1024 * 2; // 2mb
const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 16; // 16kb
const DEFAULT_MAX_SEND_BUF_SIZE: usize = 1024 * 1024; // 1mb

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) initial_conn_window_size: u32,
    pub(crate) initial_stream_window_size: u32,
    pub(crate) max_frame_size: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            initial_conn_window_size: DEFAULT_CONN_WINDOW,
            initial_stream_window_size: DEFAULT_STREAM_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

fn new_builder(config: &Config) -> Builder {
    let mut builder = Builder::default();
    builder
        .initial_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_conn_window_size)
        .max_frame_size(config.max_frame_size)
        .max_send_buffer_size(DEFAULT_MAX_SEND_BUF_SIZE)
        .enable_push(false);
    builder
}

pub(crate) async fn handshake<T>(io: T, config: &Config, exec: &Exec) -> crate::Result<ClientTx>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (h2_tx, conn) = new_builder(config)
        .handshake::<_, Bytes>(io)
        .await
        .map_err(crate::Error::new_h2)?;

    // An mpsc channel is used entirely to detect when every handle to the
    // connection has been dropped, since dropping all `SendRequest`s won't
    // notify a parked `Connection`.
    let (conn_drop_ref, rx) = mpsc::channel(1);
    let closed = Arc::new(AtomicBool::new(false));

    let conn_drop_rx = rx.into_future().map(|(item, _rx)| {
        if let Some(never) = item {
            match never {}
        }
    });

    exec.execute(conn_task(conn, conn_drop_rx, closed.clone()));

    Ok(ClientTx {
        h2_tx,
        closed,
        _conn_drop_ref: conn_drop_ref,
    })
}

async fn conn_task<C, D>(conn: C, drop_rx: D, closed: Arc<AtomicBool>)
where
    C: Future<Output = Result<(), h2::Error>> + Unpin,
    D: Future<Output = ()> + Unpin,
{
    match future::select(conn, drop_rx).await {
        Either::Left((Ok(()), _)) => trace!("connection closed"),
        Either::Left((Err(e), _)) => debug!("connection error: {}", e),
        Either::Right(((), conn)) => {
            // every handle has been dropped, polling the connection some
            // more lets it shut down gracefully
            trace!("send_request dropped, starting conn shutdown");
            if let Err(e) = conn.await {
                debug!("connection error during shutdown: {}", e);
            }
        }
    }
    closed.store(true, Ordering::Release);
}

/// A handle for opening streams on one HTTP/2 connection. Every clone is
/// an independent handle on the same connection.
#[derive(Clone)]
pub(crate) struct ClientTx {
    h2_tx: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
    // held only so the connection task sees when the last handle is gone
    _conn_drop_ref: ConnDropRef,
}

impl ClientTx {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> Poll<crate::Result<()>> {
        match ready!(self.h2_tx.poll_ready(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(err) => {
                debug!("connection is not ready for a new stream: {}", err);
                Poll::Ready(Err(crate::Error::new_closed().with(err)))
            }
        }
    }

    /// Sends `req` on a new stream and collects the whole response.
    pub(crate) async fn send(&mut self, req: Request<Bytes>) -> crate::Result<Exchange> {
        let mut detector = Detector::http2();

        let (parts, body) = req.into_parts();
        let mut req = Request::from_parts(parts, ());
        super::strip_connection_headers(req.headers_mut());

        let eos = body.is_empty();
        let (fut, mut body_tx) = self
            .h2_tx
            .send_request(req, eos)
            .map_err(|e| detector.h2(e))?;
        let stream_id = fut.stream_id().as_u32();
        trace!("sending request on stream {}", stream_id);

        if !eos {
            // A failure here surfaces as the stream's error on the response.
            if let Err(e) = send_body(&mut body_tx, body).await {
                debug!("stream {} body error: {}", stream_id, e);
            }
        }

        let res = fut.await.map_err(|e| detector.h2(e))?;
        detector.head_received();

        let (parts, mut recv) = res.into_parts();
        let mut body = BytesMut::new();
        while let Some(chunk) = recv.data().await {
            let chunk = chunk.map_err(|e| detector.h2(e))?;
            detector.received(chunk.len());
            let _ = recv.flow_control().release_capacity(chunk.len());
            body.extend_from_slice(&chunk);
        }
        detector.complete();
        trace!("stream {} complete", stream_id);

        Ok(Exchange {
            res: Response::from_parts(parts, body.freeze()),
            reusable: true,
            stream_id: Some(stream_id),
        })
    }
}

async fn send_body(tx: &mut SendStream<Bytes>, mut body: Bytes) -> Result<(), h2::Error> {
    while !body.is_empty() {
        tx.reserve_capacity(body.len());
        let cap = match future::poll_fn(|cx| tx.poll_capacity(cx)).await {
            Some(cap) => cap?,
            // the stream was closed, the response will tell why
            None => return Ok(()),
        };
        if cap == 0 {
            continue;
        }
        let chunk = body.split_to(cap.min(body.len()));
        tx.send_data(chunk, body.is_empty())?;
    }
    Ok(())
}
