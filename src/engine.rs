//! In-memory reference implementation of [`Coordinator`].
//!
//! Sessions hold a graph (a set of named nodes) and a version counter.
//! RunStep does not execute anything: it checks that every fetch and
//! target resolves, optionally sleeps for the configured step delay, and
//! echoes fed tensors back for fetches that were fed.
//!
//! Every operation completes on a spawned task, never on the event loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelToken;
use crate::config::{default_device, EngineConfig};
use crate::error::{CoordinatorError, Result};
use crate::messages::*;
use crate::service::{CallHandle, Coordinator};
use crate::status::Status;

struct Session {
    nodes: HashSet<String>,
    version: i64,
    /// Tripped when the session is closed or reset; running steps abort.
    closed: CancellationToken,
}

impl Session {
    fn new() -> Self {
        Self {
            nodes: HashSet::new(),
            version: 0,
            closed: CancellationToken::new(),
        }
    }

    /// Add `graph`'s nodes, rejecting names already present in the session
    /// or repeated within the graph.
    fn extend(&mut self, graph: &GraphDef) -> std::result::Result<(), Status> {
        let mut added = HashSet::with_capacity(graph.node.len());
        for node in &graph.node {
            if node.name.is_empty() {
                return Err(Status::invalid_argument("node without a name"));
            }
            if self.nodes.contains(&node.name) || !added.insert(node.name.as_str()) {
                return Err(Status::invalid_argument(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }
        self.nodes
            .extend(graph.node.iter().map(|node| node.name.clone()));
        Ok(())
    }

    fn resolves(&self, endpoint: &str) -> bool {
        let node = endpoint.split(':').next().unwrap_or(endpoint);
        self.nodes.contains(node)
    }
}

struct EngineState {
    devices: Vec<DeviceAttributes>,
    step_delay: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl EngineState {
    fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> std::result::Result<CreateSessionResponse, Status> {
        let mut session = Session::new();
        session.extend(&request.graph_def)?;

        let handle = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.lock().insert(handle.clone(), session);
        tracing::info!(session = %handle, nodes = request.graph_def.node.len(), "session created");

        Ok(CreateSessionResponse {
            session_handle: handle,
            graph_version: 0,
        })
    }

    fn extend_session(
        &self,
        request: &ExtendSessionRequest,
    ) -> std::result::Result<ExtendSessionResponse, Status> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&request.session_handle)
            .ok_or_else(|| unknown_session(&request.session_handle))?;

        if request.current_graph_version != session.version {
            return Err(Status::aborted(format!(
                "current version is {} but caller expected {}",
                session.version, request.current_graph_version
            )));
        }
        session.extend(&request.graph_def)?;
        session.version += 1;

        Ok(ExtendSessionResponse {
            new_graph_version: session.version,
        })
    }

    /// Resolve the step and return its outputs plus the session's close token.
    fn prepare_step(
        &self,
        request: &RunStepRequest,
    ) -> std::result::Result<(Vec<NamedTensor>, CancellationToken), Status> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(&request.session_handle)
            .ok_or_else(|| unknown_session(&request.session_handle))?;

        let feeds: HashMap<&str, &Tensor> = request
            .feed
            .iter()
            .map(|feed| (feed.name.as_str(), &feed.tensor))
            .collect();

        for endpoint in request.fetch.iter().chain(&request.target) {
            if !feeds.contains_key(endpoint.as_str()) && !session.resolves(endpoint) {
                return Err(Status::invalid_argument(format!(
                    "'{endpoint}' is neither fed nor a node of the graph"
                )));
            }
        }

        let outputs = request
            .fetch
            .iter()
            .map(|name| NamedTensor {
                name: name.clone(),
                tensor: feeds.get(name.as_str()).map(|t| (*t).clone()).unwrap_or_default(),
            })
            .collect();

        Ok((outputs, session.closed.clone()))
    }

    fn close_session(&self, request: &CloseSessionRequest) -> std::result::Result<(), Status> {
        let session = self
            .sessions
            .lock()
            .remove(&request.session_handle)
            .ok_or_else(|| unknown_session(&request.session_handle))?;
        session.closed.cancel();
        tracing::info!(session = %request.session_handle, "session closed");
        Ok(())
    }

    fn reset(&self, request: &ResetRequest) {
        let drained: Vec<Session> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.closed.cancel();
        }
        tracing::info!(
            sessions = drained.len(),
            containers = ?request.container,
            "coordinator reset"
        );
    }
}

fn unknown_session(handle: &str) -> Status {
    Status::not_found(format!("session '{handle}' is not found"))
}

fn finish_with<Req, Resp>(
    mut call: CallHandle<Req, Resp>,
    result: std::result::Result<Resp, Status>,
) where
    Resp: serde::Serialize,
{
    match result {
        Ok(response) => {
            *call.response_mut() = response;
            call.finish(Status::ok());
        }
        Err(status) => call.finish(status),
    }
}

/// Single-process coordinator keeping sessions in memory.
#[derive(Clone)]
pub struct LocalCoordinator {
    state: Arc<EngineState>,
}

impl LocalCoordinator {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        if config.devices.is_empty() {
            return Err(CoordinatorError::Config(
                "engine needs at least one device".into(),
            ));
        }
        Ok(Self {
            state: Arc::new(EngineState {
                devices: config.devices.clone(),
                step_delay: config.step_delay(),
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// One local CPU device and no step delay.
    pub fn with_default_devices() -> Self {
        Self {
            state: Arc::new(EngineState {
                devices: vec![default_device()],
                step_delay: Duration::ZERO,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().len()
    }
}

impl Coordinator for LocalCoordinator {
    fn create_session(&self, call: CallHandle<CreateSessionRequest, CreateSessionResponse>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let result = state.create_session(call.request());
            finish_with(call, result);
        });
    }

    fn extend_session(&self, call: CallHandle<ExtendSessionRequest, ExtendSessionResponse>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let result = state.extend_session(call.request());
            finish_with(call, result);
        });
    }

    fn run_step(&self, mut call: CallHandle<RunStepRequest, RunStepResponse>, cancel: CancelToken) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let (outputs, closed) = match state.prepare_step(call.request()) {
                Ok(prepared) => prepared,
                Err(status) => return call.finish(status),
            };

            if !state.step_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = closed.cancelled() => {}
                    _ = tokio::time::sleep(state.step_delay) => {}
                }
            }

            if cancel.is_cancelled() {
                tracing::debug!(request_id = ?call.request_id(), "step cancelled by client");
                return call.finish(Status::cancelled("step cancelled by client"));
            }
            if closed.is_cancelled() {
                return call.finish(Status::aborted("session closed while the step was running"));
            }

            call.response_mut().tensor = outputs;
            call.finish(Status::ok());
        });
    }

    fn close_session(&self, call: CallHandle<CloseSessionRequest, CloseSessionResponse>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let result = state
                .close_session(call.request())
                .map(|()| CloseSessionResponse {});
            finish_with(call, result);
        });
    }

    fn list_devices(&self, mut call: CallHandle<ListDevicesRequest, ListDevicesResponse>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            call.response_mut().local_device = state.devices.clone();
            call.finish(Status::ok());
        });
    }

    fn reset(&self, call: CallHandle<ResetRequest, ResetResponse>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            state.reset(call.request());
            call.finish(Status::ok());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    fn engine() -> EngineState {
        EngineState {
            devices: vec![default_device()],
            step_delay: Duration::ZERO,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn graph(names: &[&str]) -> GraphDef {
        GraphDef {
            node: names.iter().map(|n| NodeDef::new(*n, "Const")).collect(),
        }
    }

    fn session_with(state: &EngineState, names: &[&str]) -> String {
        state
            .create_session(&CreateSessionRequest {
                graph_def: graph(names),
            })
            .unwrap()
            .session_handle
    }

    #[test]
    fn test_create_session_returns_unique_handles() {
        let state = engine();
        let a = session_with(&state, &["x"]);
        let b = session_with(&state, &["x"]);
        assert_ne!(a, b);
        assert_eq!(state.sessions.lock().len(), 2);
    }

    #[test]
    fn test_create_session_rejects_duplicate_nodes() {
        let state = engine();
        let err = state
            .create_session(&CreateSessionRequest {
                graph_def: graph(&["x", "x"]),
            })
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert!(state.sessions.lock().is_empty());
    }

    #[test]
    fn test_extend_checks_version_and_bumps_it() {
        let state = engine();
        let handle = session_with(&state, &["a"]);

        let extended = state
            .extend_session(&ExtendSessionRequest {
                session_handle: handle.clone(),
                graph_def: graph(&["b"]),
                current_graph_version: 0,
            })
            .unwrap();
        assert_eq!(extended.new_graph_version, 1);

        let stale = state
            .extend_session(&ExtendSessionRequest {
                session_handle: handle.clone(),
                graph_def: graph(&["c"]),
                current_graph_version: 0,
            })
            .unwrap_err();
        assert_eq!(stale.code, Code::Aborted);

        let duplicate = state
            .extend_session(&ExtendSessionRequest {
                session_handle: handle,
                graph_def: graph(&["a"]),
                current_graph_version: 1,
            })
            .unwrap_err();
        assert_eq!(duplicate.code, Code::InvalidArgument);
    }

    #[test]
    fn test_step_resolves_fetches() {
        let state = engine();
        let handle = session_with(&state, &["y"]);
        let fed = Tensor {
            dtype: "int32".into(),
            shape: vec![1],
            content: vec![7, 0, 0, 0],
        };

        let (outputs, _) = state
            .prepare_step(&RunStepRequest {
                session_handle: handle.clone(),
                feed: vec![NamedTensor {
                    name: "x:0".into(),
                    tensor: fed.clone(),
                }],
                fetch: vec!["x:0".into(), "y:0".into()],
                target: vec!["y".into()],
            })
            .unwrap();
        assert_eq!(outputs[0].tensor, fed);
        assert_eq!(outputs[1].tensor, Tensor::default());

        let err = state
            .prepare_step(&RunStepRequest {
                session_handle: handle,
                fetch: vec!["missing:0".into()],
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let state = engine();
        let err = state
            .close_session(&CloseSessionRequest {
                session_handle: "nope".into(),
            })
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);

        let err = state
            .prepare_step(&RunStepRequest {
                session_handle: "nope".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[test]
    fn test_close_and_reset_trip_running_steps() {
        let state = engine();
        let a = session_with(&state, &[]);
        let b = session_with(&state, &[]);
        let step = |handle: &str| {
            state
                .prepare_step(&RunStepRequest {
                    session_handle: handle.to_string(),
                    ..Default::default()
                })
                .unwrap()
                .1
        };
        let closed_a = step(&a);
        let closed_b = step(&b);

        state
            .close_session(&CloseSessionRequest { session_handle: a })
            .unwrap();
        assert!(closed_a.is_cancelled());
        assert!(!closed_b.is_cancelled());

        state.reset(&ResetRequest::default());
        assert!(closed_b.is_cancelled());
        assert!(state.sessions.lock().is_empty());
    }

    #[test]
    fn test_new_requires_devices() {
        let config = EngineConfig {
            devices: vec![],
            step_delay_ms: 0,
        };
        assert!(LocalCoordinator::new(&config).is_err());
        assert!(LocalCoordinator::new(&EngineConfig::default()).is_ok());
    }
}
