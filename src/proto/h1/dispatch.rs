use bytes::{Bytes, BytesMut};
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::decode::Decoded;
use super::role::{self, ParsedHead};
use crate::client::dispatch;
use crate::client::fault::Detector;
use crate::proto::Exchange;

pub(crate) type ClientRx = dispatch::Receiver<Request<Bytes>, Exchange>;

const INIT_BUFFER_SIZE: usize = 8192;

/// Drives one HTTP/1.1 connection: requests are taken off `rx` one at a
/// time, and the connection ends after the first exchange that leaves it
/// unusable.
pub(crate) async fn run<T>(io: T, mut rx: ClientRx)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Conn::new(io);
    loop {
        if !conn.read_buf.is_empty() {
            debug!("received unexpected bytes between responses");
            break;
        }

        // A hangup seen here wins over a request already waiting, which is
        // then cancelled without ever being written.
        let next = tokio::select! {
            biased;
            err = conn.read_idle() => {
                debug!("idle connection closed: {}", err);
                None
            }
            msg = rx.recv() => msg,
        };
        let (req, mut cb) = match next {
            Some(msg) => msg,
            None => break,
        };
        if cb.is_canceled() {
            trace!("request canceled before it was written");
            continue;
        }

        let mut detector = Detector::http1();
        let result = tokio::select! {
            biased;
            result = conn.round_trip(req, &mut detector) => result,
            _ = cb.canceled() => {
                // the rest of the response would desync the next exchange
                debug!("request abandoned mid-exchange, closing connection");
                break;
            }
        };
        let keep_alive = matches!(result, Ok(ref exchange) if exchange.reusable);
        if keep_alive {
            // ready before the caller sees the response and returns the
            // connection to the pool
            rx.want();
        }
        cb.send(result);
        if !keep_alive {
            trace!("connection is not reusable, closing");
            break;
        }
    }

    // Any request queued meanwhile is answered with a cancellation.
    rx.close();
    conn.shutdown().await;
}

struct Conn<T> {
    io: T,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
}

impl<T> Conn<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn new(io: T) -> Conn<T> {
        Conn {
            io,
            read_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            write_buf: Vec::with_capacity(INIT_BUFFER_SIZE),
        }
    }

    /// Waits on an idle connection. Anything it resolves with means the
    /// connection is done.
    async fn read_idle(&mut self) -> crate::Error {
        match self.io.read_buf(&mut self.read_buf).await {
            Ok(0) => crate::Error::new_closed(),
            Ok(n) => {
                debug!("read {} bytes on an idle connection", n);
                crate::Error::new_mismatched_response()
            }
            Err(e) => crate::Error::new_io(e),
        }
    }

    async fn round_trip(
        &mut self,
        req: Request<Bytes>,
        detector: &mut Detector,
    ) -> crate::Result<Exchange> {
        let method = req.method().clone();

        self.write_buf.clear();
        role::encode_request(&req, &mut self.write_buf);
        trace!("writing {} bytes for {} {}", self.write_buf.len(), method, req.uri());
        self.io
            .write_all(&self.write_buf)
            .await
            .map_err(|e| detector.io(e))?;
        self.io.flush().await.map_err(|e| detector.io(e))?;

        let ParsedHead {
            parts,
            mut decoder,
            keep_alive,
        } = loop {
            match role::parse_response(&mut self.read_buf, &method) {
                Ok(Some(head)) => break head,
                Ok(None) => (),
                Err(e) => return Err(detector.protocol(e)),
            }
            if self.fill(detector).await? == 0 {
                return Err(detector.eof());
            }
        };
        detector.head_received();
        trace!("response head: {} {:?}", parts.status, decoder);

        let mut body = BytesMut::new();
        loop {
            match decoder.decode(&mut self.read_buf) {
                Ok(Decoded::Data(chunk)) => body.extend_from_slice(&chunk),
                Ok(Decoded::Done) => break,
                Ok(Decoded::NeedMore) => {
                    if self.fill(detector).await? == 0 {
                        if decoder.is_close_delimited() {
                            break;
                        }
                        return Err(detector.eof());
                    }
                }
                Err(e) => return Err(detector.protocol(e)),
            }
        }
        detector.complete();

        Ok(Exchange {
            res: Response::from_parts(parts, body.freeze()),
            reusable: keep_alive && !decoder.is_close_delimited(),
            stream_id: None,
        })
    }

    async fn fill(&mut self, detector: &mut Detector) -> crate::Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < INIT_BUFFER_SIZE / 4 {
            self.read_buf.reserve(INIT_BUFFER_SIZE);
        }
        match self.io.read_buf(&mut self.read_buf).await {
            Ok(n) => {
                trace!("received {} bytes", n);
                detector.received(n);
                Ok(n)
            }
            Err(e) => Err(detector.io(e)),
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.io.shutdown().await {
            trace!("error shutting down IO: {}", e);
        }
    }
}
