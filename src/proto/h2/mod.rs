use http::header::{
    HeaderName, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http::HeaderMap;
use tracing::warn;

pub(crate) mod client;

/// Removes headers that are illegal in HTTP/2, including any named by a
/// `Connection` header.
fn strip_connection_headers(headers: &mut HeaderMap) {
    // List of connection headers from:
    // https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Connection
    //
    // TE headers are allowed in HTTP/2 requests as long as the value is
    // "trailers", so they're tested separately.
    let connection_headers = [
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ];

    for header in connection_headers.iter() {
        if headers.remove(header).is_some() {
            warn!("Connection header illegal in HTTP/2: {}", header.as_str());
        }
    }

    if headers
        .get(TE)
        .map(|te_header| te_header != "trailers")
        .unwrap_or(false)
    {
        warn!("TE headers not set to \"trailers\" are illegal in HTTP/2 requests");
        headers.remove(TE);
    }

    if let Some(header) = headers.remove(CONNECTION) {
        warn!(
            "Connection header illegal in HTTP/2: {}",
            CONNECTION.as_str()
        );
        // A `Connection` header may list other headers that are meant for
        // this hop only.
        if let Ok(header_contents) = header.to_str() {
            for name in header_contents.split(',') {
                headers.remove(name.trim());
            }
        }
    }
}
