//! Runtime components
//!
//! By default, faultline spawns its background connection tasks with
//! `tokio::spawn`. A custom [`Executor`] can be supplied through
//! [`Builder::executor`](crate::client::Builder::executor).

/// An executor of futures.
pub trait Executor<Fut> {
    /// Place the future into the executor to be run.
    fn execute(&self, fut: Fut);
}

pub use crate::common::exec::BoxSendFuture;
