//! Typed client for the coordinator protocol.
//!
//! One connection carries any number of concurrent calls; responses are
//! matched to callers by request id, in whatever order they arrive.
//!
//! # Example
//!
//! ```ignore
//! use coordinator_rpc::{Client, messages::ListDevicesRequest};
//!
//! let client = Client::connect(&"127.0.0.1:7070".parse()?).await?;
//! let devices = client.list_devices(&ListDevicesRequest {}).await?;
//!
//! let step = client.start_run_step(&request).await?;
//! step.cancel().await?;
//! let outcome = step.wait().await; // Err(Status(Cancelled)) if the engine honoured it
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::codec::MsgPackCodec;
use crate::error::{CoordinatorError, Result};
use crate::messages::*;
use crate::method::Method;
use crate::protocol::{flags, Frame, FrameBuffer, Header, ABORT_METHOD_ID};
use crate::status::Status;
use crate::transport::{Endpoint, Stream};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

type PendingMap = Arc<Mutex<Option<HashMap<u32, oneshot::Sender<Frame>>>>>;

pub struct Client {
    writer: WriterHandle,
    pending: PendingMap,
    next_request_id: AtomicU32,
    reader_task: JoinHandle<()>,
    _writer_task: JoinHandle<Result<()>>,
}

impl Client {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_with(endpoint, WriterConfig::default()).await
    }

    pub async fn connect_with(endpoint: &Endpoint, writer_config: WriterConfig) -> Result<Self> {
        let stream = Stream::connect(endpoint).await?;
        let (reader, writer) = stream.into_split();
        let (writer, writer_task) = spawn_writer_task(writer, writer_config);

        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader_task = tokio::spawn(read_loop(reader, pending.clone()));
        tracing::debug!(%endpoint, "connected");

        Ok(Self {
            writer,
            pending,
            next_request_id: AtomicU32::new(1),
            reader_task,
            _writer_task: writer_task,
        })
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a raw request frame and return a handle on its response.
    pub async fn start_raw(&self, method_id: u16, payload: Bytes) -> Result<RawCall> {
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(request_id, tx);
            }
            None => return Err(CoordinatorError::ConnectionClosed),
        }

        let header = Header::new(method_id, flags::REQUEST, request_id, payload.len() as u32);
        if let Err(e) = self.writer.send(OutboundFrame::new(&header, payload)).await {
            forget(&self.pending, request_id);
            return Err(e);
        }

        Ok(RawCall {
            request_id,
            rx: Some(rx),
            writer: self.writer.clone(),
            pending: self.pending.clone(),
        })
    }

    /// Send a raw request and wait for the response frame.
    pub async fn call_raw(&self, method_id: u16, payload: Bytes) -> Result<Frame> {
        self.start_raw(method_id, payload).await?.wait_frame().await
    }

    async fn start<Req, Resp>(&self, method: Method, request: &Req) -> Result<PendingCall<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = Bytes::from(MsgPackCodec::encode(request)?);
        let raw = self.start_raw(method.id(), payload).await?;
        Ok(PendingCall {
            raw,
            _response: PhantomData,
        })
    }

    async fn call<Req, Resp>(&self, method: Method, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.start(method, request).await?.wait().await
    }

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        self.call(Method::CreateSession, request).await
    }

    pub async fn extend_session(
        &self,
        request: &ExtendSessionRequest,
    ) -> Result<ExtendSessionResponse> {
        self.call(Method::ExtendSession, request).await
    }

    pub async fn run_step(&self, request: &RunStepRequest) -> Result<RunStepResponse> {
        self.call(Method::RunStep, request).await
    }

    /// Start a RunStep that can be cancelled while it runs.
    pub async fn start_run_step(
        &self,
        request: &RunStepRequest,
    ) -> Result<PendingCall<RunStepResponse>> {
        self.start(Method::RunStep, request).await
    }

    pub async fn close_session(
        &self,
        request: &CloseSessionRequest,
    ) -> Result<CloseSessionResponse> {
        self.call(Method::CloseSession, request).await
    }

    pub async fn list_devices(&self, request: &ListDevicesRequest) -> Result<ListDevicesResponse> {
        self.call(Method::ListDevices, request).await
    }

    pub async fn reset(&self, request: &ResetRequest) -> Result<ResetResponse> {
        self.call(Method::Reset, request).await
    }

    /// Calls sent but not yet answered.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, HashMap::len)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.pending.lock().take();
    }
}

fn forget(pending: &PendingMap, request_id: u32) {
    if let Some(pending) = pending.lock().as_mut() {
        pending.remove(&request_id);
    }
}

async fn read_loop(mut reader: impl AsyncRead + Unpin, pending: PendingMap) {
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 64 * 1024];

    let result: Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            for frame in frames.push(&buf[..n])? {
                if !frame.is_response() {
                    return Err(CoordinatorError::Protocol(format!(
                        "server sent a request frame (method {})",
                        frame.method_id()
                    )));
                }
                let waiter = pending
                    .lock()
                    .as_mut()
                    .and_then(|pending| pending.remove(&frame.request_id()));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => tracing::debug!(
                        request_id = frame.request_id(),
                        "response for a call nobody waits on"
                    ),
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, "client connection failed");
    }
    // Dropping the senders fails every outstanding call.
    pending.lock().take();
}

/// An in-flight call whose response has not been decoded.
pub struct RawCall {
    request_id: u32,
    rx: Option<oneshot::Receiver<Frame>>,
    writer: WriterHandle,
    pending: PendingMap,
}

impl RawCall {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Ask the server to cancel the call. The response still arrives.
    pub async fn cancel(&self) -> Result<()> {
        let header = Header::new(ABORT_METHOD_ID, flags::REQUEST, self.request_id, 0);
        self.writer.send(OutboundFrame::empty(&header)).await
    }

    pub async fn wait_frame(mut self) -> Result<Frame> {
        let rx = self.rx.take().ok_or(CoordinatorError::ConnectionClosed)?;
        rx.await.map_err(|_| CoordinatorError::ConnectionClosed)
    }
}

impl Drop for RawCall {
    fn drop(&mut self) {
        if self.rx.is_some() {
            forget(&self.pending, self.request_id);
        }
    }
}

/// An in-flight typed call.
pub struct PendingCall<Resp> {
    raw: RawCall,
    _response: PhantomData<fn() -> Resp>,
}

impl<Resp: DeserializeOwned> PendingCall<Resp> {
    pub fn request_id(&self) -> u32 {
        self.raw.request_id()
    }

    pub async fn cancel(&self) -> Result<()> {
        self.raw.cancel().await
    }

    /// Wait for the response. A non-OK status becomes
    /// [`CoordinatorError::Status`].
    pub async fn wait(self) -> Result<Resp> {
        let frame = self.raw.wait_frame().await?;
        decode_response(&frame)
    }
}

/// Decode a response frame into either the message or the server's status.
pub fn decode_response<Resp: DeserializeOwned>(frame: &Frame) -> Result<Resp> {
    if frame.is_error() {
        let status = if frame.payload().is_empty() {
            Status::internal("error response without a status")
        } else {
            MsgPackCodec::decode::<Status>(frame.payload())?
        };
        return Err(CoordinatorError::Status(status));
    }
    MsgPackCodec::decode(frame.payload())
}
