//! Single-connection handles.
//!
//! These wrap one established transport, after protocol negotiation, in a
//! sender the pool can hold on to. Connecting, pooling and fault handling
//! happen one level up, in [`Client`](super::Client).

pub(crate) mod http1;
pub(crate) mod http2;
