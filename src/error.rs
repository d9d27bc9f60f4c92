//! Error and Result module.
use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::client::fault::Isolation;

/// Result type often returned from methods that can have faultline `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while sending a request.
///
/// Every failed request resolves to exactly one `Error`. Use
/// [`Error::fault`] to find out what went wrong in terms of the client's
/// fault taxonomy.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    isolation: Isolation,
    cause: Option<Cause>,
}

/// The class of failure a request ended with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The TLS handshake or ALPN negotiation failed.
    HandshakeFailure,
    /// The peer closed the connection, or reset the stream, before sending
    /// any part of a response.
    PrematureTermination,
    /// The transport to the target could not be established.
    ConnectFailure,
    /// The connection went away before the request could be answered.
    Cancelled,
    /// The response started, but the peer stopped before it was complete.
    IncompleteMessage,
    /// The peer violated the HTTP/1.1 or HTTP/2 protocol.
    Protocol,
    /// Some other I/O error happened on the connection.
    Io,
    /// The request itself cannot be sent.
    InvalidRequest,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Kind {
    Parse(Parse),
    /// The peer hung up before sending a single byte of the response.
    Empty,
    /// A message reached EOF, but is not complete.
    Incomplete,
    /// A client connection received a response when not waiting for one.
    MismatchedResponse,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// Indicates a connection is closed.
    Closed,
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    Io,
    /// Error occurred while connecting.
    Connect,
    /// Error occurred during the TLS handshake.
    Handshake,
    /// A general error from h2.
    Http2,
    /// User tried to create a Request with bad version.
    UnsupportedVersion,
    /// User tried to send a Request with a relative URI and no default target.
    AbsoluteUriRequired,
    /// User tried to send a Request with a scheme the client doesn't speak.
    UnsupportedScheme,
    /// User supplied a target that can't be turned into a URI or `Host` header.
    InvalidTarget,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Parse {
    Version,
    Header,
    TooLarge,
    Status,
    ChunkedEncoding,
}

impl Error {
    /// Returns the fault class of this error.
    pub fn fault(&self) -> FaultKind {
        match self.inner.kind {
            Kind::Handshake => FaultKind::HandshakeFailure,
            Kind::Empty => FaultKind::PrematureTermination,
            Kind::Connect => FaultKind::ConnectFailure,
            Kind::Canceled | Kind::Closed => FaultKind::Cancelled,
            Kind::Incomplete => FaultKind::IncompleteMessage,
            Kind::Parse(_) | Kind::MismatchedResponse | Kind::Http2 => FaultKind::Protocol,
            Kind::Io => FaultKind::Io,
            Kind::UnsupportedVersion
            | Kind::AbsoluteUriRequired
            | Kind::UnsupportedScheme
            | Kind::InvalidTarget => FaultKind::InvalidRequest,
        }
    }

    /// Returns true if the peer terminated before sending any response bytes.
    pub fn is_premature_termination(&self) -> bool {
        self.inner.kind == Kind::Empty
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        self.fault() == FaultKind::InvalidRequest
    }

    /// Returns true if this was about a request that was canceled.
    pub fn is_canceled(&self) -> bool {
        self.fault() == FaultKind::Cancelled
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        self.inner.kind == Kind::Incomplete
    }

    /// Returns true if this was an error from `Connect`.
    pub fn is_connect(&self) -> bool {
        self.inner.kind == Kind::Connect
    }

    /// Returns true if the TLS handshake failed.
    pub fn is_handshake(&self) -> bool {
        self.inner.kind == Kind::Handshake
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        let isolation = match kind {
            Kind::Parse(_)
            | Kind::Empty
            | Kind::Incomplete
            | Kind::MismatchedResponse
            | Kind::Closed
            | Kind::Io
            | Kind::Http2 => Isolation::EvictConnection,
            _ => Isolation::None,
        };
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                isolation,
                cause: None,
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn with_isolation(mut self, isolation: Isolation) -> Error {
        self.inner.isolation = isolation;
        self
    }

    pub(crate) fn isolation(&self) -> Isolation {
        self.inner.isolation
    }

    #[cfg(test)]
    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_empty() -> Error {
        Error::new(Kind::Empty)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::Incomplete)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_header() -> Error {
        Error::new(Kind::Parse(Parse::Header))
    }

    pub(crate) fn new_chunked() -> Error {
        Error::new(Kind::Parse(Parse::ChunkedEncoding))
    }

    pub(crate) fn new_mismatched_response() -> Error {
        Error::new(Kind::MismatchedResponse)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_handshake<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Handshake).with(cause)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_h2(cause: h2::Error) -> Error {
        Error::new(Kind::Http2).with(cause)
    }

    pub(crate) fn new_user_unsupported_version() -> Error {
        Error::new(Kind::UnsupportedVersion)
    }

    pub(crate) fn new_user_absolute_uri_required() -> Error {
        Error::new(Kind::AbsoluteUriRequired)
    }

    pub(crate) fn new_user_unsupported_scheme() -> Error {
        Error::new(Kind::UnsupportedScheme)
    }

    pub(crate) fn new_user_invalid_target() -> Error {
        Error::new(Kind::InvalidTarget)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::ChunkedEncoding) => "invalid chunked transfer-encoding",
            Kind::Empty => "connection closed before any response bytes were received",
            Kind::Incomplete => "connection closed before message completed",
            Kind::MismatchedResponse => "received unexpected message from connection",
            Kind::Canceled => "operation was canceled",
            Kind::Closed => "connection closed",
            Kind::Io => "an IO error occurred",
            Kind::Connect => "error trying to connect",
            Kind::Handshake => "error during TLS handshake",
            Kind::Http2 => "http2 error",
            Kind::UnsupportedVersion => "request has unsupported HTTP version",
            Kind::AbsoluteUriRequired => "client requires absolute-form URIs",
            Kind::UnsupportedScheme => "request has unsupported URI scheme",
            Kind::InvalidTarget => "request target is not a valid URI authority",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("faultline::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Status,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::status::InvalidStatusCode> for Parse {
    fn from(_: http::status::InvalidStatusCode) -> Parse {
        Parse::Status
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}
