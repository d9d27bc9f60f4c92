macro_rules! ready {
    ($e:expr) => {
        match $e {
            std::task::Poll::Ready(v) => v,
            std::task::Poll::Pending => return std::task::Poll::Pending,
        }
    };
}

pub(crate) mod exec;
pub(crate) mod never;

pub(crate) use self::never::Never;
pub(crate) use std::{future::Future, pin::Pin, task::{self, Poll}};
