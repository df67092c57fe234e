//! The service facade the dispatch core forwards calls to.
//!
//! Each operation receives a [`CallHandle`] and must eventually call
//! [`CallHandle::finish`] exactly once, from any thread. Operations are
//! invoked on the event loop, so they must return promptly and move slow
//! work onto a spawned task.
//!
//! # Example
//!
//! ```ignore
//! impl Coordinator for MyEngine {
//!     fn list_devices(&self, mut call: CallHandle<ListDevicesRequest, ListDevicesResponse>) {
//!         let devices = self.devices.clone();
//!         tokio::spawn(async move {
//!             call.response_mut().local_device = devices;
//!             call.finish(Status::ok());
//!         });
//!     }
//!     // ...
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::codec::MsgPackCodec;
use crate::messages::*;
use crate::slot::CallSlot;
use crate::status::Status;
use crate::transport::Transport;

/// Business logic behind the six coordinator methods.
pub trait Coordinator: Send + Sync + 'static {
    fn create_session(&self, call: CallHandle<CreateSessionRequest, CreateSessionResponse>);

    fn extend_session(&self, call: CallHandle<ExtendSessionRequest, ExtendSessionResponse>);

    /// The only cancellable operation: `cancel` trips when the client
    /// cancels the call or disconnects.
    fn run_step(&self, call: CallHandle<RunStepRequest, RunStepResponse>, cancel: CancelToken);

    fn close_session(&self, call: CallHandle<CloseSessionRequest, CloseSessionResponse>);

    fn list_devices(&self, call: CallHandle<ListDevicesRequest, ListDevicesResponse>);

    fn reset(&self, call: CallHandle<ResetRequest, ResetResponse>);
}

impl<T: Coordinator + ?Sized> Coordinator for Arc<T> {
    fn create_session(&self, call: CallHandle<CreateSessionRequest, CreateSessionResponse>) {
        (**self).create_session(call)
    }

    fn extend_session(&self, call: CallHandle<ExtendSessionRequest, ExtendSessionResponse>) {
        (**self).extend_session(call)
    }

    fn run_step(&self, call: CallHandle<RunStepRequest, RunStepResponse>, cancel: CancelToken) {
        (**self).run_step(call, cancel)
    }

    fn close_session(&self, call: CallHandle<CloseSessionRequest, CloseSessionResponse>) {
        (**self).close_session(call)
    }

    fn list_devices(&self, call: CallHandle<ListDevicesRequest, ListDevicesResponse>) {
        (**self).list_devices(call)
    }

    fn reset(&self, call: CallHandle<ResetRequest, ResetResponse>) {
        (**self).reset(call)
    }
}

/// Route back to the transport for one Active slot.
pub(crate) struct Completion {
    slot: Arc<CallSlot>,
    transport: Arc<Transport>,
}

impl Completion {
    pub(crate) fn new(slot: Arc<CallSlot>, transport: Arc<Transport>) -> Self {
        Self { slot, transport }
    }

    /// Detach the cancel hook, move the slot to Completed and hand the
    /// response to the transport.
    pub(crate) fn complete(self, result: std::result::Result<Bytes, Status>) {
        self.transport.clear_cancel(&self.slot);
        if let Err(e) = self.slot.complete() {
            tracing::error!(error = %e, "call completed twice");
            return;
        }
        match &result {
            Ok(_) => tracing::debug!(
                slot = self.slot.id(),
                method = %self.slot.method(),
                "call completed"
            ),
            Err(status) => tracing::debug!(
                slot = self.slot.id(),
                method = %self.slot.method(),
                code = %status.code,
                "call failed"
            ),
        }
        self.transport.send_response(self.slot, result);
    }
}

/// One in-flight call as seen by the service.
///
/// Holds the decoded request, a response buffer to fill, and the
/// completion notifier. [`finish`](Self::finish) consumes the handle, so
/// a call cannot be completed twice. Dropping an unfinished handle
/// completes the call with `Internal`.
pub struct CallHandle<Req, Resp: Serialize> {
    request: Req,
    response: Resp,
    completion: Option<Completion>,
}

impl<Req, Resp: Serialize> CallHandle<Req, Resp> {
    pub(crate) fn new(request: Req, response: Resp, completion: Completion) -> Self {
        Self {
            request,
            response,
            completion: Some(completion),
        }
    }

    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn response_mut(&mut self) -> &mut Resp {
        &mut self.response
    }

    /// Wire request id of the call.
    pub fn request_id(&self) -> Option<u32> {
        self.completion
            .as_ref()
            .and_then(|completion| completion.slot.request_id())
    }

    /// Complete the call.
    ///
    /// An OK status sends the response buffer. Any other status is sent
    /// as-is and the buffer is discarded.
    pub fn finish(mut self, status: Status) {
        if let Some(completion) = self.completion.take() {
            let result = encode_result(&self.response, status);
            completion.complete(result);
        }
    }
}

fn encode_result<Resp: Serialize>(
    response: &Resp,
    status: Status,
) -> std::result::Result<Bytes, Status> {
    if !status.is_ok() {
        return Err(status);
    }
    MsgPackCodec::encode(response)
        .map(Bytes::from)
        .map_err(|e| Status::internal(format!("failed to encode response: {e}")))
}

impl<Req, Resp: Serialize> Drop for CallHandle<Req, Resp> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            tracing::warn!(
                slot = completion.slot.id(),
                method = %completion.slot.method(),
                "call dropped without a response"
            );
            completion.complete(Err(Status::internal("call dropped without a response")));
        }
    }
}
