use bytes::BytesMut;
use http::header::{self, HeaderName, HeaderValue};
use http::response::Parts;
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};
use tracing::{debug, trace};

use super::{Decoder, MAX_HEADERS, MAX_HEAD_SIZE};
use crate::error::Parse;

/// A parsed response head, and how to read the body that follows it.
#[derive(Debug)]
pub(crate) struct ParsedHead {
    pub(crate) parts: Parts,
    pub(crate) decoder: Decoder,
    pub(crate) keep_alive: bool,
}

/// Parses a response head off the front of `buf`.
///
/// Returns `Ok(None)` if `buf` doesn't hold a full head yet. Interim (1xx)
/// responses are skipped.
pub(crate) fn parse_response(
    buf: &mut BytesMut,
    req_method: &Method,
) -> crate::Result<Option<ParsedHead>> {
    loop {
        if buf.is_empty() {
            return Ok(None);
        }

        let (len, status, version, headers) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            trace!("Response.parse([Header; {}], [u8; {}])", headers.len(), buf.len());
            let mut res = httparse::Response::new(&mut headers);
            match res.parse(&buf[..]).map_err(Parse::from)? {
                httparse::Status::Complete(len) => {
                    trace!("Response.parse Complete({})", len);
                    let code = res.code.ok_or(Parse::Status)?;
                    let status = StatusCode::from_u16(code).map_err(Parse::from)?;
                    let version = if res.version == Some(1) {
                        Version::HTTP_11
                    } else {
                        Version::HTTP_10
                    };
                    let mut map = HeaderMap::with_capacity(res.headers.len());
                    for h in res.headers.iter() {
                        let name = HeaderName::from_bytes(h.name.as_bytes())
                            .map_err(|_| crate::Error::new_header())?;
                        let value = HeaderValue::from_bytes(h.value)
                            .map_err(|_| crate::Error::new_header())?;
                        map.append(name, value);
                    }
                    (len, status, version, map)
                }
                httparse::Status::Partial => {
                    if buf.len() >= MAX_HEAD_SIZE {
                        debug!("response head is too large");
                        return Err(crate::Error::new_too_large());
                    }
                    return Ok(None);
                }
            }
        };
        let _ = buf.split_to(len);

        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            trace!("ignoring informational response: {}", status.as_u16());
            continue;
        }

        let keep_alive = status != StatusCode::SWITCHING_PROTOCOLS && is_keep_alive(version, &headers);
        let decoder = decoder_for(req_method, status, &headers)?;

        let mut res = Response::new(());
        *res.status_mut() = status;
        *res.version_mut() = version;
        *res.headers_mut() = headers;
        let (parts, ()) = res.into_parts();

        return Ok(Some(ParsedHead {
            parts,
            decoder,
            keep_alive,
        }));
    }
}

fn decoder_for(method: &Method, status: StatusCode, headers: &HeaderMap) -> crate::Result<Decoder> {
    // https://tools.ietf.org/html/rfc7230#section-3.3.3
    // 1. HEAD responses, and Status 1xx, 204, and 304 cannot have a body.
    // 2. Status 2xx to a CONNECT cannot have a body.
    // 3. Transfer-Encoding: chunked has a chunked body.
    // 4. If multiple differing Content-Length headers or invalid, close connection.
    // 5. Content-Length header has a sized body.
    // 6. Read till EOF.
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || (*method == Method::CONNECT && status.is_success())
    {
        return Ok(Decoder::length(0));
    }

    if headers.contains_key(header::TRANSFER_ENCODING) {
        return if is_chunked(headers) {
            Ok(Decoder::chunked())
        } else {
            trace!("not chunked, read till eof");
            Ok(Decoder::eof())
        };
    }

    match content_length(headers)? {
        Some(len) => Ok(Decoder::length(len)),
        None => Ok(Decoder::eof()),
    }
}

// Chunked must be the last encoding.
fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .last()
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit(',').next())
        .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> crate::Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let text = value.to_str().map_err(|_| crate::Error::new_header())?;
        for part in text.split(',') {
            let n = part
                .trim()
                .parse::<u64>()
                .map_err(|_| crate::Error::new_header())?;
            match length {
                Some(prev) if prev != n => {
                    debug!("multiple differing content-length headers");
                    return Err(crate::Error::new_header());
                }
                _ => length = Some(n),
            }
        }
    }
    Ok(length)
}

fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut close = false;
    let mut keep_alive = false;
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                let token = token.trim();
                close |= token.eq_ignore_ascii_case("close");
                keep_alive |= token.eq_ignore_ascii_case("keep-alive");
            }
        }
    }
    if close {
        false
    } else if version == Version::HTTP_10 {
        keep_alive
    } else {
        true
    }
}

/// Writes a request head, and its body with a fixed length, into `dst`.
pub(crate) fn encode_request(req: &Request<bytes::Bytes>, dst: &mut Vec<u8>) {
    let body = req.body();

    dst.extend_from_slice(req.method().as_str().as_bytes());
    dst.push(b' ');
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    dst.extend_from_slice(path.as_bytes());
    if req.version() == Version::HTTP_10 {
        dst.extend_from_slice(b" HTTP/1.0\r\n");
    } else {
        dst.extend_from_slice(b" HTTP/1.1\r\n");
    }

    for (name, value) in req.headers() {
        // The body is always written with a known length.
        if *name == header::TRANSFER_ENCODING || *name == header::CONTENT_LENGTH {
            continue;
        }
        extend_header(dst, name.as_str().as_bytes(), value.as_bytes());
    }

    if !body.is_empty() || method_has_defined_payload_semantics(req.method()) {
        let mut len = itoa::Buffer::new();
        extend_header(dst, b"content-length", len.format(body.len()).as_bytes());
    }

    dst.extend_from_slice(b"\r\n");
    dst.extend_from_slice(body);
}

fn extend_header(dst: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    dst.extend_from_slice(name);
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value);
    dst.extend_from_slice(b"\r\n");
}

fn method_has_defined_payload_semantics(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::CONNECT
    )
}
