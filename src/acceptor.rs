//! Method acceptors keep Awaiting slots registered with the transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::method::Method;
use crate::queue::CompletionQueue;
use crate::slot::CallSlot;
use crate::tag::TagAction;
use crate::transport::Transport;

pub(crate) struct MethodAcceptor {
    method: Method,
    standing: usize,
    queue: Arc<CompletionQueue>,
    transport: Arc<Transport>,
    armed: AtomicU64,
}

impl MethodAcceptor {
    pub fn new(
        method: Method,
        standing: usize,
        queue: Arc<CompletionQueue>,
        transport: Arc<Transport>,
    ) -> Self {
        Self {
            method,
            standing,
            queue,
            transport,
            armed: AtomicU64::new(0),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn standing(&self) -> usize {
        self.standing
    }

    /// Register one fresh Awaiting slot. Safe to call from a handler.
    pub fn arm(&self) {
        let slot = CallSlot::new(self.method);
        let tag = self.queue.register(TagAction::RequestReceived(slot.clone()));
        tracing::trace!(method = %self.method, slot = slot.id(), %tag, "arming slot");
        self.transport.register_awaiting(slot, tag);
        self.armed.fetch_add(1, Ordering::Relaxed);
    }

    /// Arm the standing number of slots.
    pub fn prime(&self) {
        for _ in 0..self.standing {
            self.arm();
        }
        tracing::debug!(method = %self.method, standing = self.standing, "acceptor primed");
    }

    /// Slots armed since startup.
    pub fn armed(&self) -> u64 {
        self.armed.load(Ordering::Relaxed)
    }
}
