pub(crate) use self::decode::Decoder;

mod decode;
pub(crate) mod dispatch;
mod role;

/// The maximum size of a response head, including the status line.
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// The maximum number of headers a response may carry.
const MAX_HEADERS: usize = 100;
