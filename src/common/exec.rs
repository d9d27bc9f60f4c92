use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::common::{Future, Pin};
use crate::rt::Executor;

/// A boxed background task, as handed to a custom [`Executor`].
pub type BoxSendFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Where connection tasks and the idle reaper run: `tokio::spawn`, or an
/// executor supplied through `Builder::executor`.
#[derive(Clone)]
pub(crate) enum Exec {
    Default,
    Executor(Arc<dyn Executor<BoxSendFuture> + Send + Sync>),
}

impl Exec {
    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match *self {
            Exec::Default => {
                trace!("spawning background task on tokio");
                tokio::task::spawn(fut);
            }
            Exec::Executor(ref e) => {
                trace!("spawning background task on custom executor");
                e.execute(Box::pin(fut));
            }
        }
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Exec::Default => f.write_str("Exec::Default"),
            Exec::Executor(_) => f.write_str("Exec::Executor"),
        }
    }
}
