//! Dispatch table and the generic handler path.
//!
//! Every method is served by the same steps, run on the event loop when its
//! slot's `RequestReceived` tag completes:
//!
//! 1. move the slot from Awaiting to Active
//! 2. decode the request, answering `InvalidArgument` if that fails
//! 3. for RunStep, create a [`CancelToken`] and attach its hook
//! 4. hand a [`CallHandle`] to the service
//! 5. re-arm the method, whether or not the service has finished
//!
//! Nothing here waits on the service; completion comes back through
//! [`CallHandle::finish`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::acceptor::MethodAcceptor;
use crate::cancel::{self, CancelToken};
use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::method::Method;
use crate::queue::CompletionQueue;
use crate::service::{CallHandle, Completion, Coordinator};
use crate::slot::CallSlot;
use crate::status::Status;
use crate::tag::TagAction;
use crate::transport::Transport;

/// Entry point for one method's calls.
pub(crate) type HandlerFn<S> = fn(&Dispatcher<S>, Arc<CallSlot>) -> Result<()>;

pub(crate) struct Registration<S> {
    pub method: Method,
    pub handler: HandlerFn<S>,
    pub standing: usize,
}

/// Method to handler and standing count, indexed by [`Method::index`].
pub(crate) struct DispatchTable<S> {
    entries: Vec<Registration<S>>,
}

impl<S: Coordinator> DispatchTable<S> {
    /// The fixed method set, with `standing(method)` Awaiting slots each.
    pub fn new(standing: impl Fn(Method) -> usize) -> Self {
        let entries = Method::ALL
            .iter()
            .map(|&method| Registration {
                method,
                handler: handler_for::<S>(method),
                standing: standing(method),
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, method: Method) -> &Registration<S> {
        &self.entries[method.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration<S>> {
        self.entries.iter()
    }
}

fn handler_for<S: Coordinator>(method: Method) -> HandlerFn<S> {
    match method {
        Method::CreateSession => create_session::<S>,
        Method::ExtendSession => extend_session::<S>,
        Method::RunStep => run_step::<S>,
        Method::CloseSession => close_session::<S>,
        Method::ListDevices => list_devices::<S>,
        Method::Reset => reset::<S>,
    }
}

fn create_session<S: Coordinator>(d: &Dispatcher<S>, slot: Arc<CallSlot>) -> Result<()> {
    d.serve(slot, |service, call| service.create_session(call))
}

fn extend_session<S: Coordinator>(d: &Dispatcher<S>, slot: Arc<CallSlot>) -> Result<()> {
    d.serve(slot, |service, call| service.extend_session(call))
}

fn run_step<S: Coordinator>(d: &Dispatcher<S>, slot: Arc<CallSlot>) -> Result<()> {
    d.serve_cancellable(slot, |service, call, cancel| service.run_step(call, cancel))
}

fn close_session<S: Coordinator>(d: &Dispatcher<S>, slot: Arc<CallSlot>) -> Result<()> {
    d.serve(slot, |service, call| service.close_session(call))
}

fn list_devices<S: Coordinator>(d: &Dispatcher<S>, slot: Arc<CallSlot>) -> Result<()> {
    d.serve(slot, |service, call| service.list_devices(call))
}

fn reset<S: Coordinator>(d: &Dispatcher<S>, slot: Arc<CallSlot>) -> Result<()> {
    d.serve(slot, |service, call| service.reset(call))
}

/// Shared state of the event-loop workers.
pub(crate) struct Dispatcher<S> {
    service: S,
    queue: Arc<CompletionQueue>,
    transport: Arc<Transport>,
    table: DispatchTable<S>,
    acceptors: Vec<MethodAcceptor>,
    primed: AtomicBool,
}

impl<S: Coordinator> Dispatcher<S> {
    pub fn new(
        service: S,
        queue: Arc<CompletionQueue>,
        transport: Arc<Transport>,
        table: DispatchTable<S>,
    ) -> Self {
        let acceptors = table
            .iter()
            .map(|registration| {
                MethodAcceptor::new(
                    registration.method,
                    registration.standing,
                    queue.clone(),
                    transport.clone(),
                )
            })
            .collect();
        Self {
            service,
            queue,
            transport,
            table,
            acceptors,
            primed: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Prime every acceptor. Only the first call has an effect.
    pub fn prime(&self) {
        if self.primed.swap(true, Ordering::AcqRel) {
            return;
        }
        for acceptor in &self.acceptors {
            acceptor.prime();
        }
    }

    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Acquire)
    }

    fn acceptor(&self, method: Method) -> &MethodAcceptor {
        &self.acceptors[method.index()]
    }

    /// Run the action behind one completed tag.
    pub fn on_event(&self, action: TagAction) -> Result<()> {
        match action {
            TagAction::RequestReceived(slot) => {
                let handler = self.table.get(slot.method()).handler;
                handler(self, slot)
            }
            TagAction::CancelRequested(slot) => {
                cancel::fire(&slot);
                Ok(())
            }
            TagAction::ResponseSent(slot) => {
                self.transport.retire(&slot);
                Ok(())
            }
        }
    }

    fn serve<Req, Resp, F>(&self, slot: Arc<CallSlot>, invoke: F) -> Result<()>
    where
        Req: DeserializeOwned,
        Resp: Serialize + Default,
        F: FnOnce(&S, CallHandle<Req, Resp>),
    {
        let method = slot.method();
        if let Some(call) = self.open::<Req, Resp>(slot)? {
            invoke(&self.service, call);
        }
        self.acceptor(method).arm();
        Ok(())
    }

    fn serve_cancellable<Req, Resp, F>(&self, slot: Arc<CallSlot>, invoke: F) -> Result<()>
    where
        Req: DeserializeOwned,
        Resp: Serialize + Default,
        F: FnOnce(&S, CallHandle<Req, Resp>, CancelToken),
    {
        let method = slot.method();
        let cancel_slot = slot.clone();
        if let Some(call) = self.open::<Req, Resp>(slot)? {
            let token = CancelToken::new();
            self.transport.on_cancel(&cancel_slot, token.hook());
            invoke(&self.service, call, token);
        }
        self.acceptor(method).arm();
        Ok(())
    }

    /// Activate the slot and decode its request.
    ///
    /// A payload that does not decode is answered with `InvalidArgument`
    /// here and `None` is returned. A slot in the wrong state is an
    /// invariant violation and is returned as an error.
    fn open<Req, Resp>(&self, slot: Arc<CallSlot>) -> Result<Option<CallHandle<Req, Resp>>>
    where
        Req: DeserializeOwned,
        Resp: Serialize + Default,
    {
        slot.activate()?;
        let payload = slot.payload().unwrap_or_default();
        let method = slot.method();
        let completion = Completion::new(slot, self.transport.clone());

        match MsgPackCodec::decode::<Req>(&payload) {
            Ok(request) => Ok(Some(CallHandle::new(request, Resp::default(), completion))),
            Err(e) => {
                tracing::warn!(%method, error = %e, "undecodable request");
                completion.complete(Err(Status::invalid_argument(format!(
                    "malformed {method} request: {e}"
                ))));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;
    use crate::slot::{IncomingCall, SlotState};
    use crate::transport::Peer;
    use crate::protocol::{flags, Frame, Header};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Keeps every handle it is given and never finishes them.
    #[derive(Default)]
    struct Parked {
        run_steps: Mutex<Vec<(CallHandle<RunStepRequest, RunStepResponse>, CancelToken)>>,
        resets: Mutex<Vec<CallHandle<ResetRequest, ResetResponse>>>,
    }

    impl Coordinator for Parked {
        fn create_session(&self, call: CallHandle<CreateSessionRequest, CreateSessionResponse>) {
            call.finish(Status::ok());
        }
        fn extend_session(&self, call: CallHandle<ExtendSessionRequest, ExtendSessionResponse>) {
            call.finish(Status::ok());
        }
        fn run_step(&self, call: CallHandle<RunStepRequest, RunStepResponse>, cancel: CancelToken) {
            self.run_steps.lock().push((call, cancel));
        }
        fn close_session(&self, call: CallHandle<CloseSessionRequest, CloseSessionResponse>) {
            call.finish(Status::ok());
        }
        fn list_devices(&self, call: CallHandle<ListDevicesRequest, ListDevicesResponse>) {
            call.finish(Status::ok());
        }
        fn reset(&self, call: CallHandle<ResetRequest, ResetResponse>) {
            self.resets.lock().push(call);
        }
    }

    fn dispatcher(service: Arc<Parked>) -> Dispatcher<Arc<Parked>> {
        let queue = Arc::new(CompletionQueue::new());
        let transport = Transport::new(queue.clone(), 8);
        let table = DispatchTable::new(|method| if method == Method::RunStep { 3 } else { 1 });
        Dispatcher::new(service, queue, transport, table)
    }

    fn filled_slot(method: Method, payload: &'static [u8]) -> Arc<CallSlot> {
        let slot = CallSlot::new(method);
        slot.fill(IncomingCall {
            request_id: 1,
            payload: Bytes::from_static(payload),
            peer: Peer::detached(),
        })
        .unwrap();
        slot
    }

    fn encoded<T: Serialize>(value: &T) -> &'static [u8] {
        Box::leak(MsgPackCodec::encode(value).unwrap().into_boxed_slice())
    }

    #[tokio::test]
    async fn test_prime_is_idempotent() {
        let d = dispatcher(Arc::default());
        d.prime();
        d.prime();

        let stats = d.transport().stats();
        assert_eq!(stats.awaiting_for(Method::RunStep), 3);
        assert_eq!(stats.awaiting_for(Method::Reset), 1);
        assert!(d.is_primed());
    }

    #[tokio::test]
    async fn test_handler_rearms_while_service_holds_call() {
        let service = Arc::new(Parked::default());
        let d = dispatcher(service.clone());

        let slot = filled_slot(Method::Reset, encoded(&ResetRequest::default()));
        d.on_event(TagAction::RequestReceived(slot.clone())).unwrap();

        assert_eq!(slot.state(), SlotState::Active);
        assert_eq!(service.resets.lock().len(), 1);
        assert_eq!(d.transport().stats().awaiting_for(Method::Reset), 1);
    }

    #[tokio::test]
    async fn test_malformed_request_still_rearms() {
        let service = Arc::new(Parked::default());
        let d = dispatcher(service.clone());

        let slot = filled_slot(Method::Reset, b"\xc1");
        d.on_event(TagAction::RequestReceived(slot.clone())).unwrap();

        assert_eq!(slot.state(), SlotState::Completed);
        assert!(service.resets.lock().is_empty());
        assert_eq!(d.transport().stats().awaiting_for(Method::Reset), 1);
    }

    #[tokio::test]
    async fn test_cancel_event_trips_run_step_token() {
        let service = Arc::new(Parked::default());
        let d = dispatcher(service.clone());

        let slot = filled_slot(Method::RunStep, encoded(&RunStepRequest::default()));
        d.on_event(TagAction::RequestReceived(slot.clone())).unwrap();
        assert!(slot.has_cancel_hook());

        assert!(slot.request_cancel());
        d.on_event(TagAction::CancelRequested(slot.clone())).unwrap();

        let parked = service.run_steps.lock();
        assert!(parked[0].1.is_cancelled());
        assert_eq!(slot.state(), SlotState::Active);
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_trips_token_once() {
        let service = Arc::new(Parked::default());
        let d = dispatcher(service.clone());
        let queue = d.queue().clone();
        let peer = Peer::detached();

        let slot = CallSlot::new(Method::RunStep);
        let tag = queue.register(TagAction::RequestReceived(slot.clone()));
        d.transport().register_awaiting(slot.clone(), tag);
        let payload = Bytes::from_static(encoded(&RunStepRequest::default()));
        let header = Header::new(Method::RunStep.id(), flags::REQUEST, 7, payload.len() as u32);
        d.transport()
            .on_frame(&peer, Frame::new(header, payload))
            .await
            .unwrap();

        // The client cancels before the loop has run the handler.
        assert_eq!(d.transport().request_cancel(&peer, 7), None);
        assert_eq!(slot.state(), SlotState::Awaiting);
        assert!(slot.is_cancel_requested());

        let event = queue.next().await.unwrap();
        assert_eq!(event.tag, tag);
        d.on_event(queue.take(tag).unwrap()).unwrap();
        assert!(!service.run_steps.lock()[0].1.is_cancelled());

        let event = queue.next().await.unwrap();
        let action = queue.take(event.tag).unwrap();
        assert_eq!(action.kind(), "cancel_requested");
        d.on_event(action).unwrap();
        assert!(service.run_steps.lock()[0].1.is_cancelled());
        assert!(!slot.has_cancel_hook());

        // A repeated cancel posts nothing further.
        assert_eq!(d.transport().request_cancel(&peer, 7), None);
        let further = tokio::time::timeout(Duration::from_millis(20), queue.next()).await;
        assert!(further.is_err(), "only one cancel event may be posted");
        assert_eq!(slot.state(), SlotState::Active);
    }

    #[tokio::test]
    async fn test_handler_rejects_slot_in_wrong_state() {
        let d = dispatcher(Arc::default());
        let slot = CallSlot::new(Method::Reset);
        assert!(d.on_event(TagAction::RequestReceived(slot)).is_err());
    }

    #[test]
    fn test_table_covers_every_method() {
        let table: DispatchTable<Arc<Parked>> = DispatchTable::new(Method::default_standing);
        for method in Method::ALL {
            let registration = table.get(method);
            assert_eq!(registration.method, method);
            assert_eq!(registration.standing, method.default_standing());
        }
    }
}
