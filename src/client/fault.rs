//! Classification of abnormal request termination.
//!
//! Every in-flight request owns a [`Detector`]. The protocol code reports
//! progress to it (bytes seen, response head parsed, body finished) and hands
//! it whatever went wrong. The detector turns that into an [`Error`] whose
//! [`Isolation`] tells the client how far the damage reaches: for HTTP/1.1 a
//! fault always costs the connection, for HTTP/2 a stream reset only costs
//! the stream.

use std::io;

use http::Version;
use tracing::trace;

use crate::error::Error;

/// What has to be thrown away because of a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Isolation {
    /// Nothing besides the request itself.
    None,
    /// Only the HTTP/2 stream; its connection stays usable.
    ResetStream,
    /// The connection must never be handed out again.
    EvictConnection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    AwaitingResponse,
    Receiving,
    Completed,
}

#[derive(Debug)]
pub(crate) struct Detector {
    version: Version,
    state: State,
    received: usize,
}

impl Detector {
    pub(crate) fn http1() -> Detector {
        Detector::new(Version::HTTP_11)
    }

    pub(crate) fn http2() -> Detector {
        Detector::new(Version::HTTP_2)
    }

    fn new(version: Version) -> Detector {
        Detector {
            version,
            state: State::AwaitingResponse,
            received: 0,
        }
    }

    /// Records response bytes read off the transport.
    pub(crate) fn received(&mut self, n: usize) {
        self.received += n;
    }

    /// A valid response head was parsed.
    pub(crate) fn head_received(&mut self) {
        debug_assert_eq!(self.state, State::AwaitingResponse);
        self.state = State::Receiving;
    }

    /// The response completed successfully.
    pub(crate) fn complete(&mut self) {
        self.finish();
    }

    pub(crate) fn is_awaiting_response(&self) -> bool {
        self.state == State::AwaitingResponse
    }

    /// The transport hit EOF.
    pub(crate) fn eof(&mut self) -> Error {
        let err = self.terminated();
        self.finish();
        err
    }

    /// The transport returned an I/O error.
    pub(crate) fn io(&mut self, err: io::Error) -> Error {
        let out = if is_hangup(&err) {
            trace!("io error looks like a hangup: {}", err);
            self.terminated().with(err)
        } else {
            Error::new_io(err).with_isolation(self.connection_scope())
        };
        self.finish();
        out
    }

    /// The HTTP/2 layer reported an error for this stream.
    pub(crate) fn h2(&mut self, err: h2::Error) -> Error {
        let out = if err.is_go_away() {
            Error::new_canceled()
                .with(err)
                .with_isolation(Isolation::EvictConnection)
        } else if err.is_io() {
            self.terminated()
                .with(err)
                .with_isolation(Isolation::EvictConnection)
        } else if err.reason().is_some() {
            // RST_STREAM only ever concerns this one stream.
            let refused = err.reason() == Some(h2::Reason::REFUSED_STREAM);
            let base = if refused {
                Error::new_canceled()
            } else {
                self.terminated()
            };
            base.with(err).with_isolation(Isolation::ResetStream)
        } else {
            Error::new_h2(err).with_isolation(Isolation::EvictConnection)
        };
        self.finish();
        out
    }

    /// An error produced by the protocol code itself, such as a malformed
    /// response head.
    pub(crate) fn protocol(&mut self, err: Error) -> Error {
        self.finish();
        err.with_isolation(self.connection_scope())
    }

    fn terminated(&self) -> Error {
        let err = if self.state == State::AwaitingResponse && self.received == 0 {
            Error::new_empty()
        } else {
            Error::new_incomplete()
        };
        err.with_isolation(self.stream_scope())
    }

    // Scope of a hangup: the whole connection on HTTP/1.1, the stream on HTTP/2.
    fn stream_scope(&self) -> Isolation {
        if self.version == Version::HTTP_2 {
            Isolation::ResetStream
        } else {
            Isolation::EvictConnection
        }
    }

    fn connection_scope(&self) -> Isolation {
        Isolation::EvictConnection
    }

    fn finish(&mut self) {
        debug_assert_ne!(self.state, State::Completed, "request completed twice");
        self.state = State::Completed;
    }
}

fn is_hangup(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    #[test]
    fn eof_before_any_bytes_is_premature_termination() {
        let mut detector = Detector::http1();
        let err = detector.eof();
        assert_eq!(err.fault(), FaultKind::PrematureTermination);
        assert_eq!(err.isolation(), Isolation::EvictConnection);
        assert!(!detector.is_awaiting_response());
    }

    #[test]
    fn eof_after_partial_head_is_incomplete() {
        let mut detector = Detector::http1();
        detector.received(12);
        let err = detector.eof();
        assert_eq!(err.fault(), FaultKind::IncompleteMessage);
    }

    #[test]
    fn eof_during_body_is_incomplete() {
        let mut detector = Detector::http1();
        detector.received(64);
        detector.head_received();
        let err = detector.eof();
        assert!(err.is_incomplete_message());
        assert_eq!(err.isolation(), Isolation::EvictConnection);
    }

    #[test]
    fn connection_reset_before_response_is_premature_termination() {
        let mut detector = Detector::http1();
        let err = detector.io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_premature_termination());
    }

    #[test]
    fn other_io_errors_keep_their_kind() {
        let mut detector = Detector::http1();
        let err = detector.io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.fault(), FaultKind::Io);
        assert_eq!(err.isolation(), Isolation::EvictConnection);
    }

    #[test]
    fn h2_stream_reset_only_resets_the_stream() {
        let mut detector = Detector::http2();
        let err = detector.h2(h2::Error::from(h2::Reason::INTERNAL_ERROR));
        assert!(err.is_premature_termination());
        assert_eq!(err.isolation(), Isolation::ResetStream);
    }

    #[test]
    fn h2_refused_stream_is_cancelled() {
        let mut detector = Detector::http2();
        let err = detector.h2(h2::Error::from(h2::Reason::REFUSED_STREAM));
        assert_eq!(err.fault(), FaultKind::Cancelled);
        assert_eq!(err.isolation(), Isolation::ResetStream);
    }

    #[test]
    fn protocol_errors_evict_connection() {
        let mut detector = Detector::http2();
        detector.head_received();
        let err = detector.protocol(Error::new_header());
        assert!(err.is_parse());
        assert_eq!(err.isolation(), Isolation::EvictConnection);
    }
}
