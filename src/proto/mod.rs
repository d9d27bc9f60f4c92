//! Pieces pertaining to the HTTP message protocol.
use bytes::Bytes;
use http::Response;

pub(crate) mod h1;
pub(crate) mod h2;

/// A response read off a connection, along with what it says about the
/// connection.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) res: Response<Bytes>,
    /// Whether another request may follow on the same connection.
    pub(crate) reusable: bool,
    pub(crate) stream_id: Option<u32>,
}
