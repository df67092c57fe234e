//! Server wiring: listener, connections, event-loop workers.
//!
//! # Example
//!
//! ```ignore
//! use coordinator_rpc::{LocalCoordinator, Method, ServerBuilder};
//!
//! let server = ServerBuilder::new()
//!     .listen("127.0.0.1:0".parse()?)
//!     .workers(2)
//!     .standing(Method::RunStep, 200)
//!     .serve(LocalCoordinator::with_default_devices())
//!     .await?;
//!
//! println!("listening on {}", server.local_endpoint());
//! server.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dispatch::{DispatchTable, Dispatcher};
use crate::engine::LocalCoordinator;
use crate::error::{CoordinatorError, Result};
use crate::event_loop::EventLoop;
use crate::method::Method;
use crate::queue::CompletionQueue;
use crate::service::Coordinator;
use crate::transport::{serve_connection, Endpoint, Listener, Peer, ServerStats, Transport};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Pause after a failed accept, so a persistent error (e.g. fd exhaustion)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Fluent builder on top of [`ServerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn listen(mut self, endpoint: Endpoint) -> Self {
        self.config.listen = endpoint;
        self
    }

    /// Number of event-loop workers.
    ///
    /// Default: 1
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Standing Awaiting slots for `method`.
    ///
    /// Default: 100 for RunStep, 1 otherwise
    pub fn standing(mut self, method: Method, standing: usize) -> Self {
        self.config.slots.set(method, standing);
        self
    }

    /// Calls per method that may queue for a slot before being refused.
    ///
    /// Default: 1024
    pub fn max_backlog(mut self, max_backlog: usize) -> Self {
        self.config.max_backlog = max_backlog;
        self
    }

    pub fn max_payload_size(mut self, max_payload_size: u32) -> Self {
        self.config.max_payload_size = max_payload_size;
        self
    }

    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start serving with the built-in engine configured in `[engine]`.
    pub async fn serve_local(self) -> Result<Server> {
        let engine = LocalCoordinator::new(&self.config.engine)?;
        self.serve(engine).await
    }

    /// Bind the listener and start serving `service`.
    pub async fn serve<S: Coordinator>(self, service: S) -> Result<Server> {
        Server::start(self.config, service).await
    }
}

/// A running server. Dropping it stops accepting and closes connections.
pub struct Server {
    local: Endpoint,
    transport: Arc<Transport>,
    queue: Arc<CompletionQueue>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    async fn start<S: Coordinator>(config: ServerConfig, service: S) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(CompletionQueue::new());
        let transport = Transport::new(queue.clone(), config.max_backlog);
        let table = DispatchTable::new(|method| config.slots.standing(method));
        let dispatcher = Arc::new(Dispatcher::new(
            service,
            queue.clone(),
            transport.clone(),
            table,
        ));

        let listener = Listener::bind(&config.listen).await?;
        let local = listener.local_endpoint()?;

        // Slots exist before the first connection can be accepted.
        dispatcher.prime();

        let shutdown = CancellationToken::new();
        let workers = (0..config.workers)
            .map(|worker| {
                let event_loop = EventLoop::new(dispatcher.clone(), worker);
                let shutdown = shutdown.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let result = event_loop.run().await;
                    if let Err(e) = &result {
                        tracing::error!(worker, error = %e, "event loop failed, shutting down");
                        queue.shutdown();
                        shutdown.cancel();
                    }
                    result
                })
            })
            .collect();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            transport.clone(),
            config.writer.to_writer_config(),
            config.max_payload_size,
            shutdown.clone(),
        ));

        tracing::info!(
            endpoint = %local,
            workers = config.workers,
            run_step_slots = config.slots.standing(Method::RunStep),
            "coordinator serving"
        );

        Ok(Self {
            local,
            transport,
            queue,
            shutdown,
            accept_task: Some(accept_task),
            workers,
        })
    }

    /// The bound endpoint, with the real port when `:0` was requested.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn stats(&self) -> ServerStats {
        self.transport.stats()
    }

    /// Resolves once the server starts shutting down, either through
    /// [`shutdown`](Self::shutdown) or because an event loop failed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Stop accepting, close every connection, and drain the event loops.
    ///
    /// Returns the first event-loop failure, if any.
    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!(endpoint = %self.local, "coordinator shutting down");
        self.shutdown.cancel();
        self.queue.shutdown();

        if let Some(accept_task) = self.accept_task.take() {
            let _ = accept_task.await;
        }

        let mut outcome = Ok(());
        for worker in self.workers.drain(..) {
            let result = worker
                .await
                .map_err(|e| CoordinatorError::Io(std::io::Error::other(e)))
                .and_then(|result| result);
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.queue.shutdown();
    }
}

async fn accept_loop(
    listener: Listener,
    transport: Arc<Transport>,
    writer_config: WriterConfig,
    max_payload_size: u32,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let (reader, writer) = stream.into_split();
        let (writer, _writer_task) = spawn_writer_task(writer, writer_config.clone());
        let peer = Peer::new(addr, writer);
        tokio::spawn(serve_connection(
            transport.clone(),
            peer,
            reader,
            max_payload_size,
            shutdown.child_token(),
        ));
    }
    tracing::debug!("accept loop stopped");
}
