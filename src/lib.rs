//! # coordinator-rpc
//!
//! Asynchronous RPC front door for a distributed computation coordinator.
//!
//! A single listener serves six fixed methods (CreateSession, ExtendSession,
//! RunStep, CloseSession, ListDevices, Reset) and forwards each call to a
//! [`Coordinator`] implementation without ever blocking the network layer.
//!
//! ## Architecture
//!
//! - **Transport**: per-connection readers route frames into per-method
//!   pools of Awaiting call slots (or a bounded backlog)
//! - **Completion queue**: every readiness notification is a one-shot tag
//! - **Event loop**: drains the queue, runs handlers, re-arms methods
//! - **Service facade**: completes each call exactly once through its
//!   [`CallHandle`]; RunStep also receives a [`CancelToken`]
//!
//! ## Example
//!
//! ```ignore
//! use coordinator_rpc::{Client, LocalCoordinator, ServerBuilder};
//! use coordinator_rpc::messages::ListDevicesRequest;
//!
//! #[tokio::main]
//! async fn main() -> coordinator_rpc::Result<()> {
//!     let server = ServerBuilder::new()
//!         .listen("127.0.0.1:0".parse()?)
//!         .serve(LocalCoordinator::with_default_devices())
//!         .await?;
//!
//!     let client = Client::connect(server.local_endpoint()).await?;
//!     let devices = client.list_devices(&ListDevicesRequest {}).await?;
//!     println!("{:?}", devices.local_device);
//!
//!     server.shutdown().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod slot;
pub mod status;
pub mod tag;
pub mod transport;

mod acceptor;
mod cancel;
mod client;
mod dispatch;
mod event_loop;
mod method;
mod queue;
mod server;
mod service;
mod writer;

pub use cancel::CancelToken;
pub use client::{decode_response, Client, PendingCall, RawCall};
pub use config::ServerConfig;
pub use engine::LocalCoordinator;
pub use error::{CoordinatorError, Result};
pub use method::Method;
pub use server::{Server, ServerBuilder};
pub use service::{CallHandle, Coordinator};
pub use status::{Code, Status};
pub use transport::{Endpoint, ServerStats};
pub use writer::WriterConfig;
