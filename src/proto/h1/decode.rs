use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use self::Kind::{Chunked, Eof, Length};

/// Decoders to handle different Transfer-Encodings.
///
/// If a message body does not include a Transfer-Encoding, it *should*
/// include a Content-Length header.
#[derive(Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    /// A Reader used when a Content-Length header is passed with a positive integer.
    Length(u64),
    /// A Reader used when Transfer-Encoding is `chunked`.
    Chunked(ChunkedState, u64),
    /// A Reader used for responses that don't indicate a length or chunked.
    ///
    /// > If a Transfer-Encoding header field is present in a response and
    /// > the chunked transfer coding is not the final encoding, the
    /// > message body length is determined by reading the connection until
    /// > it is closed by the server.
    Eof,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

/// One step of decoding a body out of the read buffer.
#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    Data(Bytes),
    /// The buffer ran dry before the body ended.
    NeedMore,
    Done,
}

impl Decoder {
    // constructors

    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked(ChunkedState::Size, 0),
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder { kind: Kind::Eof }
    }

    // methods

    /// Whether only the transport closing ends the body.
    pub(crate) fn is_close_delimited(&self) -> bool {
        self.kind == Kind::Eof
    }

    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> crate::Result<Decoded> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Decoded::Done);
                }
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let n = std::cmp::min(*remaining, buf.len() as u64) as usize;
                *remaining -= n as u64;
                Ok(Decoded::Data(buf.split_to(n).freeze()))
            }
            Chunked(ref mut state, ref mut size) => loop {
                if *state == ChunkedState::End {
                    trace!("end of chunked");
                    return Ok(Decoded::Done);
                }
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let mut data = None;
                // advances the chunked state
                *state = state.step(buf, size, &mut data)?;
                if let Some(data) = data {
                    return Ok(Decoded::Data(data));
                }
            },
            Eof => {
                if buf.is_empty() {
                    Ok(Decoded::NeedMore)
                } else {
                    Ok(Decoded::Data(buf.split().freeze()))
                }
            }
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

// Callers make sure `buf` is not empty.
fn next_byte(buf: &mut BytesMut) -> u8 {
    let byte = buf[0];
    buf.advance(1);
    byte
}

impl ChunkedState {
    fn step(
        &self,
        buf: &mut BytesMut,
        size: &mut u64,
        data: &mut Option<Bytes>,
    ) -> crate::Result<ChunkedState> {
        use self::ChunkedState::*;
        match *self {
            Size => ChunkedState::read_size(buf, size),
            SizeLws => ChunkedState::read_size_lws(buf),
            Extension => ChunkedState::read_extension(buf),
            SizeLf => ChunkedState::read_size_lf(buf, *size),
            Body => ChunkedState::read_body(buf, size, data),
            BodyCr => ChunkedState::expect(buf, b'\r', BodyLf),
            BodyLf => ChunkedState::expect(buf, b'\n', Size),
            Trailer => ChunkedState::read_trailer(buf),
            TrailerLf => ChunkedState::expect(buf, b'\n', EndCr),
            EndCr => ChunkedState::read_end_cr(buf),
            EndLf => ChunkedState::expect(buf, b'\n', End),
            End => Ok(ChunkedState::End),
        }
    }

    fn read_size(buf: &mut BytesMut, size: &mut u64) -> crate::Result<ChunkedState> {
        trace!("Read chunk hex size");

        macro_rules! or_overflow {
            ($e:expr) => (
                match $e {
                    Some(val) => val,
                    None => {
                        trace!("chunk size overflows u64");
                        return Err(crate::Error::new_chunked());
                    }
                }
            )
        }

        let radix = 16;
        match next_byte(buf) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(ChunkedState::SizeLws),
            b';' => return Ok(ChunkedState::Extension),
            b'\r' => return Ok(ChunkedState::SizeLf),
            _ => {
                trace!("Invalid chunk size line: Invalid Size");
                return Err(crate::Error::new_chunked());
            }
        }
        Ok(ChunkedState::Size)
    }

    fn read_size_lws(buf: &mut BytesMut) -> crate::Result<ChunkedState> {
        trace!("read_size_lws");
        match next_byte(buf) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Ok(ChunkedState::SizeLws),
            b';' => Ok(ChunkedState::Extension),
            b'\r' => Ok(ChunkedState::SizeLf),
            _ => Err(crate::Error::new_chunked()),
        }
    }

    fn read_extension(buf: &mut BytesMut) -> crate::Result<ChunkedState> {
        trace!("read_extension");
        // We don't care about extensions really at all. Just ignore them.
        // They "end" at the next CRLF.
        match next_byte(buf) {
            b'\r' => Ok(ChunkedState::SizeLf),
            b'\n' => Err(crate::Error::new_chunked()),
            _ => Ok(ChunkedState::Extension), // no supported extensions
        }
    }

    fn read_size_lf(buf: &mut BytesMut, size: u64) -> crate::Result<ChunkedState> {
        trace!("Chunk size is {:?}", size);
        match next_byte(buf) {
            b'\n' => {
                if size == 0 {
                    Ok(ChunkedState::EndCr)
                } else {
                    trace!("incoming chunked header: {0:#X} ({0} bytes)", size);
                    Ok(ChunkedState::Body)
                }
            }
            _ => Err(crate::Error::new_chunked()),
        }
    }

    fn read_body(
        buf: &mut BytesMut,
        rem: &mut u64,
        data: &mut Option<Bytes>,
    ) -> crate::Result<ChunkedState> {
        trace!("Chunked read, remaining={:?}", rem);

        let n = std::cmp::min(*rem, buf.len() as u64) as usize;
        *data = Some(buf.split_to(n).freeze());
        *rem -= n as u64;

        if *rem > 0 {
            Ok(ChunkedState::Body)
        } else {
            Ok(ChunkedState::BodyCr)
        }
    }

    fn read_trailer(buf: &mut BytesMut) -> crate::Result<ChunkedState> {
        trace!("read_trailer");
        match next_byte(buf) {
            b'\r' => Ok(ChunkedState::TrailerLf),
            _ => Ok(ChunkedState::Trailer),
        }
    }

    fn read_end_cr(buf: &mut BytesMut) -> crate::Result<ChunkedState> {
        match next_byte(buf) {
            b'\r' => Ok(ChunkedState::EndLf),
            // Trailers are skipped, they end with an empty line too.
            _ => Ok(ChunkedState::Trailer),
        }
    }

    fn expect(buf: &mut BytesMut, byte: u8, next: ChunkedState) -> crate::Result<ChunkedState> {
        if next_byte(buf) == byte {
            Ok(next)
        } else {
            Err(crate::Error::new_chunked())
        }
    }
}
