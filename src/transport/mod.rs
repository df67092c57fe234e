//! Transport multiplexer.
//!
//! Owns everything between the sockets and the completion queue:
//! - per-method pools of Awaiting slots registered by the acceptors
//! - per-method backlogs of calls that arrived while no slot was free
//! - per-connection tables of in-flight request ids
//! - response delivery through each connection's writer task
//!
//! Lock order is method queue, then connection table, then slot. The tag
//! arena and completion queue locks are leaves.

mod connection;
mod listener;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::codec::MsgPackCodec;
use crate::error::{CoordinatorError, Result};
use crate::method::Method;
use crate::protocol::{flags, Frame, Header};
use crate::queue::CompletionQueue;
use crate::slot::{CallSlot, IncomingCall};
use crate::status::Status;
use crate::tag::{Tag, TagAction};
use crate::writer::{OutboundFrame, WriterHandle};

pub(crate) use connection::serve_connection;
pub use listener::{Endpoint, Listener, Stream};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection's in-flight request currently lives.
enum CallEntry {
    /// Waiting in the method backlog.
    Queued(Method),
    /// Bound to a slot.
    Matched(Arc<CallSlot>),
}

/// One client connection as seen by the dispatch core.
pub(crate) struct Peer {
    id: u64,
    addr: String,
    writer: WriterHandle,
    calls: Mutex<HashMap<u32, CallEntry>>,
    closed: AtomicBool,
}

impl Peer {
    pub fn new(addr: impl Into<String>, writer: WriterHandle) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.into(),
            writer,
            calls: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// A peer whose responses go nowhere.
    #[cfg(test)]
    pub fn detached() -> Arc<Self> {
        let (writer, _task) = crate::writer::spawn_writer_task(
            tokio::io::sink(),
            crate::writer::WriterConfig::default(),
        );
        Self::new("detached", writer)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Handle a response that could not be written while the connection
    /// is still up. The client can no longer learn the call's outcome, so
    /// the connection is closed and every call the client still waits on
    /// fails with it.
    fn write_failed(&self, failures: &AtomicU64, request_id: u32, error: &CoordinatorError) {
        if self.is_closed() || self.writer.is_closed() {
            tracing::debug!(
                request_id,
                peer = self.id,
                error = %error,
                "peer gone, response dropped"
            );
            return;
        }
        failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            request_id,
            peer = self.id,
            addr = %self.addr,
            error = %error,
            "failed to write response, closing connection"
        );
        self.writer.close();
    }
}

#[derive(Default)]
struct MethodQueue {
    awaiting: VecDeque<(Arc<CallSlot>, Tag)>,
    backlog: VecDeque<IncomingCall>,
}

/// Point-in-time counters, see [`crate::Server::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Awaiting slots per method, in method id order.
    pub awaiting: Vec<(Method, usize)>,
    /// Backlogged calls per method, in method id order.
    pub backlog: Vec<(Method, usize)>,
    /// Calls bound to a slot whose response has not been written yet.
    pub in_flight: usize,
    /// Responses written since startup.
    pub completed: u64,
    /// Calls refused because their method backlog was full.
    pub rejected: u64,
    /// Responses that could not be written to a live connection, each of
    /// which closed that connection.
    pub write_failures: u64,
    pub connections: usize,
}

impl ServerStats {
    pub fn awaiting_for(&self, method: Method) -> usize {
        lookup(&self.awaiting, method)
    }

    pub fn backlog_for(&self, method: Method) -> usize {
        lookup(&self.backlog, method)
    }
}

fn lookup(counts: &[(Method, usize)], method: Method) -> usize {
    counts
        .iter()
        .find(|(m, _)| *m == method)
        .map_or(0, |(_, n)| *n)
}

pub struct Transport {
    queue: Arc<CompletionQueue>,
    methods: Vec<Mutex<MethodQueue>>,
    max_backlog: usize,
    runtime: Handle,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
    write_failures: Arc<AtomicU64>,
    connections: AtomicUsize,
}

impl Transport {
    /// Must be called from within a tokio runtime; responses are written by
    /// tasks spawned on it.
    pub(crate) fn new(queue: Arc<CompletionQueue>, max_backlog: usize) -> Arc<Self> {
        Arc::new(Self {
            queue,
            methods: Method::ALL
                .iter()
                .map(|_| Mutex::new(MethodQueue::default()))
                .collect(),
            max_backlog,
            runtime: Handle::current(),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            write_failures: Arc::new(AtomicU64::new(0)),
            connections: AtomicUsize::new(0),
        })
    }

    fn method_queue(&self, method: Method) -> &Mutex<MethodQueue> {
        &self.methods[method.index()]
    }

    /// Offer an Awaiting slot for the next call of its method.
    ///
    /// A backlogged call is bound immediately and the tag completed;
    /// otherwise the slot waits in the pool.
    pub(crate) fn register_awaiting(&self, slot: Arc<CallSlot>, tag: Tag) {
        let method = slot.method();
        let mut queue = self.method_queue(method).lock();
        match queue.backlog.pop_front() {
            Some(call) => {
                self.bind(&slot, tag, call);
            }
            None => queue.awaiting.push_back((slot, tag)),
        }
    }

    /// Bind `call` to `slot` and report the slot's tag. The caller holds the
    /// slot's method queue lock.
    fn bind(&self, slot: &Arc<CallSlot>, tag: Tag, call: IncomingCall) {
        let peer = call.peer.clone();
        let request_id = call.request_id;
        peer.calls
            .lock()
            .insert(request_id, CallEntry::Matched(slot.clone()));

        if let Err(e) = slot.fill(call) {
            tracing::error!(slot = slot.id(), error = %e, "awaiting slot refused call");
            self.queue.complete(tag, false).ok();
            return;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            slot = slot.id(),
            method = %slot.method(),
            request_id,
            peer = peer.id,
            "call bound to slot"
        );
        if self.queue.complete(tag, true).is_err() {
            tracing::debug!(slot = slot.id(), "completion queue shut down, call dropped");
        }
    }

    /// Route one frame received on `peer`.
    ///
    /// An error means the peer violated the protocol and the connection
    /// should be closed.
    pub(crate) async fn on_frame(&self, peer: &Arc<Peer>, frame: Frame) -> Result<()> {
        let header = frame.header;
        if header.flags & flags::RESERVED_MASK != 0 {
            return Err(CoordinatorError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }
        if header.is_response() {
            return Err(CoordinatorError::Protocol(format!(
                "unexpected response frame for request {}",
                header.request_id
            )));
        }

        if header.is_abort() {
            if let Some(status) = self.request_cancel(peer, header.request_id) {
                self.reply(peer, header.method_id, header.request_id, status)
                    .await;
            }
            return Ok(());
        }

        let method = match Method::from_id(header.method_id) {
            Some(method) => method,
            None => {
                tracing::warn!(
                    method_id = header.method_id,
                    request_id = header.request_id,
                    "call to unknown method"
                );
                let status = Status::unimplemented(format!(
                    "method id {} is not served",
                    header.method_id
                ));
                self.reply(peer, header.method_id, header.request_id, status)
                    .await;
                return Ok(());
            }
        };

        if let Some(status) = self.incoming(peer, method, header.request_id, frame.payload)? {
            self.reply(peer, method.id(), header.request_id, status).await;
        }
        Ok(())
    }

    /// Match a new call against an Awaiting slot or park it in the backlog.
    ///
    /// Returns the status to answer with when the call is refused outright.
    fn incoming(
        &self,
        peer: &Arc<Peer>,
        method: Method,
        request_id: u32,
        payload: Bytes,
    ) -> Result<Option<Status>> {
        let mut queue = self.method_queue(method).lock();
        if peer.calls.lock().contains_key(&request_id) {
            return Err(CoordinatorError::Protocol(format!(
                "duplicate in-flight request id {request_id}"
            )));
        }

        let call = IncomingCall {
            request_id,
            payload,
            peer: peer.clone(),
        };

        if let Some((slot, tag)) = queue.awaiting.pop_front() {
            self.bind(&slot, tag, call);
            return Ok(None);
        }

        if queue.backlog.len() >= self.max_backlog {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%method, request_id, "backlog full, refusing call");
            return Ok(Some(Status::unavailable(format!(
                "{method} backlog is full"
            ))));
        }

        peer.calls
            .lock()
            .insert(request_id, CallEntry::Queued(method));
        queue.backlog.push_back(call);
        tracing::debug!(%method, request_id, backlog = queue.backlog.len(), "call backlogged");
        Ok(None)
    }

    /// Cancel the call `request_id` of `peer`.
    ///
    /// A backlogged call is withdrawn and answered with the returned status.
    /// A bound call gets its slot flagged and, if the handler attached a hook,
    /// a `CancelRequested` event.
    pub(crate) fn request_cancel(&self, peer: &Arc<Peer>, request_id: u32) -> Option<Status> {
        let queued = match peer.calls.lock().get(&request_id) {
            None => {
                tracing::debug!(request_id, "cancel for unknown or finished call");
                return None;
            }
            Some(CallEntry::Matched(slot)) => {
                self.cancel_slot(slot);
                return None;
            }
            Some(CallEntry::Queued(method)) => *method,
        };

        // Re-check under the proper lock order; the call may have been bound
        // in the meantime.
        let mut queue = self.method_queue(queued).lock();
        let position = queue
            .backlog
            .iter()
            .position(|call| call.peer.id == peer.id && call.request_id == request_id);
        if let Some(position) = position {
            queue.backlog.remove(position);
            peer.calls.lock().remove(&request_id);
            tracing::debug!(method = %queued, request_id, "backlogged call cancelled");
            return Some(Status::cancelled("call cancelled before dispatch"));
        }
        drop(queue);

        if let Some(CallEntry::Matched(slot)) = peer.calls.lock().get(&request_id) {
            self.cancel_slot(slot);
        }
        None
    }

    fn cancel_slot(&self, slot: &Arc<CallSlot>) {
        if slot.request_cancel() {
            if self
                .queue
                .post(TagAction::CancelRequested(slot.clone()))
                .is_err()
            {
                tracing::debug!(slot = slot.id(), "cancel after shutdown ignored");
            }
        } else {
            tracing::trace!(slot = slot.id(), "cancel flagged");
        }
    }

    /// Attach the cancel hook of an Active slot.
    ///
    /// If the client already cancelled, the hook is fired through the
    /// event loop right away.
    pub(crate) fn on_cancel(&self, slot: &Arc<CallSlot>, hook: crate::cancel::CancelHook) {
        if slot.install_cancel_hook(hook)
            && self
                .queue
                .post(TagAction::CancelRequested(slot.clone()))
                .is_err()
        {
            tracing::debug!(slot = slot.id(), "cancel after shutdown ignored");
        }
    }

    /// Detach the cancel hook; later cancels become no-ops.
    pub(crate) fn clear_cancel(&self, slot: &CallSlot) {
        drop(slot.take_cancel_hook());
    }

    /// Write the response of a Completed slot and post `ResponseSent`.
    ///
    /// `result` is the encoded response message, or the status to answer
    /// with instead.
    pub(crate) fn send_response(
        &self,
        slot: Arc<CallSlot>,
        result: std::result::Result<Bytes, Status>,
    ) {
        let call = match slot.call() {
            Some(call) => call,
            None => {
                tracing::error!(slot = slot.id(), "response for a slot without a call");
                return;
            }
        };

        {
            let mut calls = call.peer.calls.lock();
            let owned = matches!(
                calls.get(&call.request_id),
                Some(CallEntry::Matched(bound)) if bound.id() == slot.id()
            );
            if owned {
                calls.remove(&call.request_id);
            }
        }

        let frame = match response_frame(slot.method().id(), call.request_id, result) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(slot = slot.id(), error = %e, "failed to encode status");
                error_frame_fallback(slot.method().id(), call.request_id)
            }
        };

        let tag = self.queue.register(TagAction::ResponseSent(slot));
        let queue = self.queue.clone();
        let failures = self.write_failures.clone();
        self.runtime.spawn(async move {
            if call.peer.is_closed() {
                tracing::debug!(request_id = call.request_id, "peer gone, dropping response");
            } else if let Err(e) = call.peer.writer.send(frame).await {
                call.peer.write_failed(&failures, call.request_id, &e);
            }
            // The slot is done either way: the client got the response or
            // lost its connection.
            if queue.complete(tag, true).is_err() {
                tracing::trace!("response sent after shutdown");
            }
        });
    }

    /// Answer a call that never got a slot.
    async fn reply(&self, peer: &Arc<Peer>, method_id: u16, request_id: u32, status: Status) {
        let frame = match response_frame(method_id, request_id, Err(status)) {
            Ok(frame) => frame,
            Err(_) => error_frame_fallback(method_id, request_id),
        };
        if let Err(e) = peer.writer.send(frame).await {
            peer.write_failed(&self.write_failures, request_id, &e);
        }
    }

    /// Bookkeeping once the event loop observed `ResponseSent`.
    pub(crate) fn retire(&self, slot: &CallSlot) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(slot = slot.id(), method = %slot.method(), "slot retired");
    }

    pub(crate) fn connected(&self, peer: &Peer) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(peer = peer.id, addr = %peer.addr, "peer connected");
    }

    /// Forget a closed connection: its backlogged calls are dropped and its
    /// bound calls are cancelled.
    pub(crate) fn disconnect(&self, peer: &Arc<Peer>) {
        if peer.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connections.fetch_sub(1, Ordering::Relaxed);

        let mut dropped = 0;
        for queue in &self.methods {
            let mut queue = queue.lock();
            let before = queue.backlog.len();
            queue.backlog.retain(|call| call.peer.id != peer.id);
            dropped += before - queue.backlog.len();
        }

        let bound: Vec<Arc<CallSlot>> = peer
            .calls
            .lock()
            .drain()
            .filter_map(|(_, entry)| match entry {
                CallEntry::Matched(slot) => Some(slot),
                CallEntry::Queued(_) => None,
            })
            .collect();

        for slot in &bound {
            self.cancel_slot(slot);
        }

        tracing::debug!(
            peer = peer.id,
            addr = %peer.addr,
            backlogged = dropped,
            cancelled = bound.len(),
            "peer disconnected"
        );
    }

    pub fn stats(&self) -> ServerStats {
        let mut awaiting = Vec::with_capacity(Method::COUNT);
        let mut backlog = Vec::with_capacity(Method::COUNT);
        for method in Method::ALL {
            let queue = self.method_queue(method).lock();
            awaiting.push((method, queue.awaiting.len()));
            backlog.push((method, queue.backlog.len()));
        }
        ServerStats {
            awaiting,
            backlog,
            in_flight: self.in_flight.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

fn response_frame(
    method_id: u16,
    request_id: u32,
    result: std::result::Result<Bytes, Status>,
) -> Result<OutboundFrame> {
    let (flags, payload) = match result {
        Ok(payload) => (flags::RESPONSE, payload),
        Err(status) => (
            flags::ERROR_RESPONSE,
            Bytes::from(MsgPackCodec::encode(&status)?),
        ),
    };
    let header = Header::new(method_id, flags, request_id, payload.len() as u32);
    Ok(OutboundFrame::new(&header, payload))
}

fn error_frame_fallback(method_id: u16, request_id: u32) -> OutboundFrame {
    OutboundFrame::empty(&Header::new(
        method_id,
        flags::ERROR_RESPONSE,
        request_id,
        0,
    ))
}
