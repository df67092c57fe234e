//! Cancellation bridge.
//!
//! The transport learns about a client cancel (an ABORT frame, or the
//! connection going away) on a connection task. It only flags the slot and
//! posts a `CancelRequested` event; the event loop then [`fire`]s the hook
//! the handler attached, which trips the call's [`CancelToken`].
//!
//! The hook is a `FnOnce` taken out of the slot when fired, and completion
//! detaches it, so a token observes cancellation at most once and never
//! after its call has completed.

use tokio_util::sync::CancellationToken;

use crate::slot::CallSlot;

/// Closure run on the event loop when the client cancels an Active call.
pub(crate) type CancelHook = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation signal handed to the service with RunStep.
///
/// Cheap to clone and readable from any thread. Once cancelled it stays
/// cancelled. The service may poll [`is_cancelled`](Self::is_cancelled),
/// await [`cancelled`](Self::cancelled), or ignore it altogether.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once the client has cancelled the call.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancel();
    }

    /// The hook that trips this token.
    pub(crate) fn hook(&self) -> CancelHook {
        let token = self.clone();
        Box::new(move || token.cancel())
    }
}

/// Run the slot's hook if it still has one. Called on the event loop.
pub(crate) fn fire(slot: &CallSlot) -> bool {
    match slot.take_cancel_hook() {
        Some(hook) => {
            tracing::debug!(slot = slot.id(), method = %slot.method(), "cancelling call");
            hook();
            true
        }
        None => {
            tracing::trace!(slot = slot.id(), "cancel arrived after completion");
            false
        }
    }
}
