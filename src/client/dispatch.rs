use futures_channel::{mpsc, oneshot};
use futures_core::Stream;
use futures_util::future;
use tracing::trace;

use crate::common::{task, Pin, Poll};

pub(crate) type Promise<T> = oneshot::Receiver<crate::Result<T>>;

pub(crate) fn channel<T, U>() -> (Sender<T, U>, Receiver<T, U>) {
    let (tx, rx) = mpsc::unbounded();
    let (giver, taker) = want::new();
    let tx = Sender {
        buffered_once: false,
        giver,
        inner: tx,
    };
    let rx = Receiver { inner: rx, taker };
    (tx, rx)
}

/// A bounded sender of requests and callbacks for when responses are ready.
///
/// While the inner sender is unbounded, the Giver is used to determine
/// if the Receiver is ready for another request.
pub(crate) struct Sender<T, U> {
    /// One message is always allowed, even if the Receiver hasn't asked
    /// for it yet. This boolean keeps track of whether we've sent one
    /// without notice.
    buffered_once: bool,
    /// The Giver helps watch that the Receiver side has been polled
    /// when the queue is empty. This helps us know when a request and
    /// response have been fully processed, and a connection is ready
    /// for more.
    giver: want::Giver,
    /// Actually bounded by the Giver, plus `buffered_once`.
    inner: mpsc::UnboundedSender<Envelope<T, U>>,
}

impl<T, U> Sender<T, U> {
    pub(crate) fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> Poll<crate::Result<()>> {
        self.giver
            .poll_want(cx)
            .map_err(|_| crate::Error::new_closed())
    }

    /// Whether the receiver has asked for another request, meaning the
    /// previous exchange is over.
    pub(crate) fn is_ready(&self) -> bool {
        self.giver.is_wanting()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.giver.is_canceled()
    }

    fn can_send(&mut self) -> bool {
        if self.giver.give() || !self.buffered_once {
            // If the receiver is ready *now*, then of course we can send.
            //
            // If the receiver isn't ready yet, but we don't have anything
            // in the channel yet, then allow one message.
            self.buffered_once = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn send(&mut self, val: T) -> Result<Promise<U>, T> {
        if !self.can_send() {
            return Err(val);
        }
        let (tx, rx) = oneshot::channel();
        self.inner
            .unbounded_send(Envelope(Some((val, Callback { tx: Some(tx) }))))
            .map(move |_| rx)
            .map_err(|e| {
                let mut env = e.into_inner();
                match env.take() {
                    Some((val, cb)) => {
                        // the receiver is gone, nobody will answer this callback
                        cb.forget();
                        val
                    }
                    None => unreachable!("envelope not dropped"),
                }
            })
    }
}

pub(crate) struct Receiver<T, U> {
    inner: mpsc::UnboundedReceiver<Envelope<T, U>>,
    taker: want::Taker,
}

impl<T, U> Receiver<T, U> {
    pub(crate) fn poll_recv(
        &mut self,
        cx: &mut task::Context<'_>,
    ) -> Poll<Option<(T, Callback<U>)>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(item) => Poll::Ready(item.and_then(|mut env| env.take())),
            Poll::Pending => {
                self.taker.want();
                Poll::Pending
            }
        }
    }

    pub(crate) async fn recv(&mut self) -> Option<(T, Callback<U>)> {
        future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Tells the sender another request is welcome before the receiver is
    /// polled again.
    pub(crate) fn want(&mut self) {
        self.taker.want();
    }

    pub(crate) fn close(&mut self) {
        self.taker.cancel();
        self.inner.close();
    }
}

impl<T, U> Drop for Receiver<T, U> {
    fn drop(&mut self) {
        // Notify the giver about the closure first, before dropping
        // the mpsc::Receiver.
        self.taker.cancel();
    }
}

struct Envelope<T, U>(Option<(T, Callback<U>)>);

impl<T, U> Envelope<T, U> {
    fn take(&mut self) -> Option<(T, Callback<U>)> {
        self.0.take()
    }
}

impl<T, U> Drop for Envelope<T, U> {
    fn drop(&mut self) {
        if let Some((_, cb)) = self.0.take() {
            cb.send(Err(crate::Error::new_canceled().with("connection closed")));
        }
    }
}

/// Resolves the promise of exactly one request.
///
/// If it is dropped without being used, the promise resolves with a
/// cancellation error, so a caller is never left waiting on a connection
/// task that went away.
pub(crate) struct Callback<U> {
    tx: Option<oneshot::Sender<crate::Result<U>>>,
}

impl<U> Callback<U> {
    pub(crate) fn is_canceled(&self) -> bool {
        match self.tx {
            Some(ref tx) => tx.is_canceled(),
            None => true,
        }
    }

    /// Resolves once the caller stopped waiting for the response.
    pub(crate) async fn canceled(&mut self) {
        match self.tx {
            Some(ref mut tx) => tx.cancellation().await,
            None => future::pending().await,
        }
    }

    pub(crate) fn send(mut self, val: crate::Result<U>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(val);
        }
    }

    fn forget(mut self) {
        self.tx.take();
    }
}

impl<U> Drop for Callback<U> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            trace!("callback dropped without a response");
            let _ = tx.send(Err(crate::Error::new_canceled().with("dispatch task is gone")));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::{channel, Receiver};
    use crate::error::FaultKind;

    #[derive(Debug)]
    struct Custom(i32);

    /// Helper to check if the future is ready after polling once.
    struct PollOnce<'a, T, U>(&'a mut Receiver<T, U>);

    impl<T, U> Future for PollOnce<'_, T, U> {
        type Output = Option<()>;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            match self.0.poll_recv(cx) {
                Poll::Ready(_) => Poll::Ready(Some(())),
                Poll::Pending => Poll::Ready(None),
            }
        }
    }

    #[tokio::test]
    async fn drop_receiver_sends_cancel_errors() {
        let (mut tx, mut rx) = channel::<Custom, ()>();

        // must poll once for send to succeed
        assert!(PollOnce(&mut rx).await.is_none(), "rx empty");

        let promise = tx.send(Custom(43)).unwrap();
        drop(rx);

        let fulfilled = promise.await;
        let err = fulfilled
            .expect("fulfilled")
            .expect_err("promise should error");
        assert_eq!(err.fault(), FaultKind::Cancelled);
    }

    #[tokio::test]
    async fn dropped_callback_resolves_promise() {
        let (mut tx, mut rx) = channel::<Custom, ()>();
        let promise = tx.send(Custom(7)).unwrap();

        let (_req, cb) = rx.recv().await.expect("received");
        drop(cb);

        let err = promise.await.expect("fulfilled").expect_err("canceled");
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn sender_checks_for_want_on_send() {
        let (mut tx, mut rx) = channel::<Custom, ()>();

        // one is allowed to buffer, second is rejected
        let _ = tx.send(Custom(1)).expect("1 buffered");
        tx.send(Custom(2)).expect_err("2 not ready");

        assert!(PollOnce(&mut rx).await.is_some(), "rx empty");

        // Even though 1 has been popped, only 1 could be buffered for the
        // lifetime of the channel.
        tx.send(Custom(2)).expect_err("2 still not ready");

        assert!(PollOnce(&mut rx).await.is_none(), "rx empty");

        let _ = tx.send(Custom(2)).expect("2 ready");
    }

    #[tokio::test]
    async fn sender_is_ready_only_while_receiver_wants() {
        let (mut tx, mut rx) = channel::<Custom, ()>();
        assert!(!tx.is_ready());

        assert!(PollOnce(&mut rx).await.is_none(), "rx empty");
        assert!(tx.is_ready());

        let _promise = tx.send(Custom(1)).expect("ready");
        // taken by the send, the receiver is busy with it
        assert!(!tx.is_ready());

        let (_req, _cb) = rx.recv().await.expect("received");
        rx.want();
        assert!(tx.is_ready());
    }

    #[tokio::test]
    async fn callback_observes_abandoned_promise() {
        let (mut tx, mut rx) = channel::<Custom, ()>();
        let promise = tx.send(Custom(9)).unwrap();
        let (_req, mut cb) = rx.recv().await.expect("received");

        drop(promise);
        tokio::time::timeout(std::time::Duration::from_secs(5), cb.canceled())
            .await
            .expect("cancellation observed");
        assert!(cb.is_canceled());
    }

    #[tokio::test]
    async fn closed_receiver_is_observed_by_sender() {
        let (tx, rx) = channel::<Custom, ()>();
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
    }
}
