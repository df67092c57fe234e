//! Per-call state.
//!
//! A [`CallSlot`] is created Awaiting by a method acceptor, filled by the
//! transport when a matching call arrives, moved to Active by its handler
//! and to Completed by the call's completion. Each transition happens
//! exactly once; anything else is reported as
//! [`CoordinatorError::SlotState`]. Slots are never reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cancel::CancelHook;
use crate::error::{CoordinatorError, Result};
use crate::method::Method;
use crate::transport::Peer;

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Registered with the transport, no call bound yet.
    Awaiting,
    /// Bound to a call and handed to the service.
    Active,
    /// The service reported completion; the response is on its way.
    Completed,
}

/// A received call, as delivered by the transport.
#[derive(Clone)]
pub(crate) struct IncomingCall {
    pub request_id: u32,
    pub payload: Bytes,
    pub peer: Arc<Peer>,
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("request_id", &self.request_id)
            .field("payload_len", &self.payload.len())
            .field("peer", &self.peer.id())
            .finish()
    }
}

pub struct CallSlot {
    id: u64,
    method: Method,
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    state: SlotState,
    call: Option<IncomingCall>,
    cancel_hook: Option<CancelHook>,
    cancel_requested: bool,
}

impl CallSlot {
    /// A fresh Awaiting slot.
    pub(crate) fn new(method: Method) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            method,
            inner: Mutex::new(SlotInner {
                state: SlotState::Awaiting,
                call: None,
                cancel_hook: None,
                cancel_requested: false,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().state
    }

    fn invalid(&self, transition: &'static str, state: SlotState) -> CoordinatorError {
        CoordinatorError::SlotState {
            slot: self.id,
            transition,
            state,
        }
    }

    /// Bind an incoming call. Only an empty Awaiting slot can be filled.
    pub(crate) fn fill(&self, call: IncomingCall) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SlotState::Awaiting || inner.call.is_some() {
            return Err(self.invalid("fill", inner.state));
        }
        inner.call = Some(call);
        Ok(())
    }

    /// Awaiting (with a call bound) to Active.
    pub(crate) fn activate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SlotState::Awaiting || inner.call.is_none() {
            return Err(self.invalid("activate", inner.state));
        }
        inner.state = SlotState::Active;
        Ok(())
    }

    /// Active to Completed. Detaches any cancel hook first.
    pub(crate) fn complete(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SlotState::Active {
            return Err(self.invalid("complete", inner.state));
        }
        inner.cancel_hook = None;
        inner.state = SlotState::Completed;
        Ok(())
    }

    pub(crate) fn payload(&self) -> Option<Bytes> {
        self.inner.lock().call.as_ref().map(|call| call.payload.clone())
    }

    pub(crate) fn call(&self) -> Option<IncomingCall> {
        self.inner.lock().call.clone()
    }

    pub fn request_id(&self) -> Option<u32> {
        self.inner.lock().call.as_ref().map(|call| call.request_id)
    }

    /// Attach the cancel hook of an Active call.
    ///
    /// Returns true when a cancel was already requested, in which case the
    /// hook is stored but the caller must arrange for it to be fired.
    /// Outside Active the hook is dropped and false is returned.
    pub(crate) fn install_cancel_hook(&self, hook: CancelHook) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SlotState::Active || inner.cancel_hook.is_some() {
            return false;
        }
        inner.cancel_hook = Some(hook);
        inner.cancel_requested
    }

    /// Record a cancel request.
    ///
    /// Returns true only for the first request on a slot that has a hook
    /// attached; later requests and requests before the hook exists only
    /// set the sticky flag.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        let first = !inner.cancel_requested;
        inner.cancel_requested = true;
        first && inner.state == SlotState::Active && inner.cancel_hook.is_some()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.lock().cancel_requested
    }

    pub(crate) fn take_cancel_hook(&self) -> Option<CancelHook> {
        self.inner.lock().cancel_hook.take()
    }

    pub(crate) fn has_cancel_hook(&self) -> bool {
        self.inner.lock().cancel_hook.is_some()
    }
}

impl std::fmt::Debug for CallSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CallSlot")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("state", &inner.state)
            .field("call", &inner.call)
            .field("cancel_requested", &inner.cancel_requested)
            .finish()
    }
}
