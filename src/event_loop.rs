//! The completion-driven event loop.
//!
//! Any number of workers may run [`EventLoop::run`] over the same
//! dispatcher; they share one completion queue and each event is handled
//! by exactly one of them.

use std::sync::Arc;

use crate::dispatch::Dispatcher;
use crate::error::{CoordinatorError, Result};
use crate::service::Coordinator;

pub(crate) struct EventLoop<S> {
    dispatcher: Arc<Dispatcher<S>>,
    worker: usize,
}

impl<S: Coordinator> EventLoop<S> {
    pub fn new(dispatcher: Arc<Dispatcher<S>>, worker: usize) -> Self {
        Self { dispatcher, worker }
    }

    /// Prime the acceptors and handle events until the queue is shut down
    /// and drained.
    ///
    /// A failed or stale event means the dispatch bookkeeping is broken;
    /// it is returned as an error and the loop stops.
    pub async fn run(self) -> Result<()> {
        self.dispatcher.prime();
        let queue = self.dispatcher.queue().clone();
        tracing::debug!(worker = self.worker, "event loop started");

        let mut handled: u64 = 0;
        while let Some(event) = queue.next().await {
            if !event.ok {
                let _ = queue.take(event.tag);
                tracing::error!(
                    worker = self.worker,
                    tag = %event.tag,
                    "completion reported failure"
                );
                return Err(CoordinatorError::FailedEvent(event.tag));
            }

            let action = queue.take(event.tag).inspect_err(|e| {
                tracing::error!(worker = self.worker, error = %e, "stale completion tag");
            })?;
            tracing::trace!(worker = self.worker, tag = %event.tag, kind = action.kind(), "event");

            self.dispatcher.on_event(action).inspect_err(|e| {
                tracing::error!(worker = self.worker, error = %e, "dispatch invariant violated");
            })?;
            handled += 1;
        }

        tracing::debug!(worker = self.worker, handled, "event loop drained");
        Ok(())
    }
}
