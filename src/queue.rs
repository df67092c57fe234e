//! The completion queue the event loop drains.
//!
//! It is the readiness multiplexer between the transport and the loop:
//! the transport [`complete`](CompletionQueue::complete)s tags as things
//! happen, and any number of event-loop workers pull [`Event`]s from
//! [`next`](CompletionQueue::next). The channel is unbounded so that a
//! completing call can never be stalled behind a slow loop.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{CoordinatorError, Result};
use crate::tag::{Tag, TagAction, TagTable};

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Event {
    pub tag: Tag,
    /// False when the transport reports the operation failed.
    pub ok: bool,
}

pub(crate) struct CompletionQueue {
    tags: TagTable,
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tags: TagTable::new(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Park an action whose completion will be reported later.
    pub fn register(&self, action: TagAction) -> Tag {
        self.tags.insert(action)
    }

    /// Report a registered tag as ready.
    ///
    /// After shutdown the tag is dropped from the arena and
    /// `QueueShutdown` is returned.
    pub fn complete(&self, tag: Tag, ok: bool) -> Result<()> {
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Event { tag, ok }).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            self.tags.discard(tag);
            Err(CoordinatorError::QueueShutdown)
        }
    }

    /// Register and immediately complete an action.
    pub fn post(&self, action: TagAction) -> Result<Tag> {
        let tag = self.register(action);
        self.complete(tag, true)?;
        Ok(tag)
    }

    /// Wait for the next event. `None` once shut down and drained.
    ///
    /// Safe to call from several workers at once; each event is delivered
    /// to exactly one of them.
    pub async fn next(&self) -> Option<Event> {
        self.rx.lock().await.recv().await
    }

    /// Consume the action behind a delivered tag.
    pub fn take(&self, tag: Tag) -> Result<TagAction> {
        self.tags.take(tag)
    }

    /// Stop accepting events. Already queued events are still delivered.
    pub fn shutdown(&self) {
        self.tx.lock().take();
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Actions registered but not yet taken.
    pub fn pending(&self) -> usize {
        self.tags.len()
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}
