//! End-to-end dispatch scenarios over TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coordinator_rpc::config::EngineConfig;
use coordinator_rpc::messages::*;
use coordinator_rpc::{
    CallHandle, CancelToken, Client, Code, Coordinator, CoordinatorError, LocalCoordinator,
    Method, Server, ServerBuilder, Status,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

fn builder() -> ServerBuilder {
    ServerBuilder::new().listen("127.0.0.1:0".parse().unwrap())
}

fn engine(step_delay_ms: u64) -> LocalCoordinator {
    LocalCoordinator::new(&EngineConfig {
        step_delay_ms,
        ..EngineConfig::default()
    })
    .unwrap()
}

fn code_of<T: std::fmt::Debug>(result: coordinator_rpc::Result<T>) -> Code {
    match result {
        Err(CoordinatorError::Status(status)) => status.code,
        other => panic!("expected a status error, got {other:?}"),
    }
}

async fn wait_until(server: &Server, done: impl Fn(&coordinator_rpc::ServerStats) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(&server.stats()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("server did not reach the expected state");
}

/// Holds on to RunStep calls instead of finishing them and reports each
/// call's token. Everything else completes immediately.
struct Stalling {
    tokens: mpsc::UnboundedSender<CancelToken>,
    held: Mutex<Vec<CallHandle<RunStepRequest, RunStepResponse>>>,
    dropped_resets: bool,
}

impl Stalling {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CancelToken>) {
        let (tokens, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            tokens,
            held: Mutex::new(Vec::new()),
            dropped_resets: false,
        });
        (service, rx)
    }

    fn release_all(&self, status: Status) {
        for call in self.held.lock().drain(..) {
            call.finish(status.clone());
        }
    }
}

impl Coordinator for Stalling {
    fn create_session(&self, mut call: CallHandle<CreateSessionRequest, CreateSessionResponse>) {
        call.response_mut().session_handle = "stalled".into();
        call.finish(Status::ok());
    }

    fn extend_session(&self, call: CallHandle<ExtendSessionRequest, ExtendSessionResponse>) {
        call.finish(Status::ok());
    }

    fn run_step(&self, call: CallHandle<RunStepRequest, RunStepResponse>, cancel: CancelToken) {
        let _ = self.tokens.send(cancel);
        self.held.lock().push(call);
    }

    fn close_session(&self, call: CallHandle<CloseSessionRequest, CloseSessionResponse>) {
        call.finish(Status::ok());
    }

    fn list_devices(&self, call: CallHandle<ListDevicesRequest, ListDevicesResponse>) {
        call.finish(Status::ok());
    }

    fn reset(&self, call: CallHandle<ResetRequest, ResetResponse>) {
        if self.dropped_resets {
            drop(call);
        } else {
            call.finish(Status::ok());
        }
    }
}

#[tokio::test]
async fn test_standing_slots_exist_after_startup() {
    let server = builder()
        .standing(Method::ListDevices, 3)
        .serve(engine(0))
        .await
        .unwrap();

    let stats = server.stats();
    assert_eq!(stats.awaiting_for(Method::RunStep), 100);
    assert_eq!(stats.awaiting_for(Method::ListDevices), 3);
    for method in [
        Method::CreateSession,
        Method::ExtendSession,
        Method::CloseSession,
        Method::Reset,
    ] {
        assert_eq!(stats.awaiting_for(method), 1, "{method}");
    }
    assert_eq!(stats.in_flight, 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_lifecycle() {
    let engine = engine(0);
    let server = builder().serve(engine.clone()).await.unwrap();
    let client = Client::connect(server.local_endpoint()).await.unwrap();

    let created = client
        .create_session(&CreateSessionRequest {
            graph_def: GraphDef {
                node: vec![
                    NodeDef::new("x", "Placeholder"),
                    NodeDef::new("y", "Square").with_input("x"),
                ],
            },
        })
        .await
        .unwrap();
    assert_eq!(created.graph_version, 0);
    assert_eq!(engine.session_count(), 1);
    let handle = created.session_handle;

    let extended = client
        .extend_session(&ExtendSessionRequest {
            session_handle: handle.clone(),
            graph_def: GraphDef {
                node: vec![NodeDef::new("z", "Identity").with_input("y")],
            },
            current_graph_version: 0,
        })
        .await
        .unwrap();
    assert_eq!(extended.new_graph_version, 1);

    let fed = Tensor {
        dtype: "float".into(),
        shape: vec![],
        content: vec![0, 0, 64, 64],
    };
    let step = client
        .run_step(&RunStepRequest {
            session_handle: handle.clone(),
            feed: vec![NamedTensor {
                name: "x:0".into(),
                tensor: fed.clone(),
            }],
            fetch: vec!["x:0".into(), "z:0".into()],
            target: vec!["z".into()],
        })
        .await
        .unwrap();
    assert_eq!(step.tensor.len(), 2);
    assert_eq!(step.tensor[0].tensor, fed);

    client
        .close_session(&CloseSessionRequest {
            session_handle: handle.clone(),
        })
        .await
        .unwrap();
    assert_eq!(engine.session_count(), 0);

    let again = client
        .close_session(&CloseSessionRequest {
            session_handle: handle,
        })
        .await;
    assert_eq!(code_of(again), Code::NotFound);

    wait_until(&server, |stats| stats.in_flight == 0).await;
    assert_eq!(server.stats().completed, 5);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_more_concurrent_steps_than_standing_slots() {
    let server = builder().serve(engine(50)).await.unwrap();
    let client = Arc::new(Client::connect(server.local_endpoint()).await.unwrap());
    let session = client
        .create_session(&CreateSessionRequest::default())
        .await
        .unwrap()
        .session_handle;

    let mut steps = Vec::new();
    for _ in 0..150 {
        let client = client.clone();
        let request = RunStepRequest {
            session_handle: session.clone(),
            ..Default::default()
        };
        steps.push(tokio::spawn(async move { client.run_step(&request).await }));
    }

    for step in steps {
        step.await.unwrap().unwrap();
    }

    wait_until(&server, |stats| stats.in_flight == 0).await;
    let stats = server.stats();
    assert_eq!(stats.awaiting_for(Method::RunStep), 100);
    assert_eq!(stats.backlog_for(Method::RunStep), 0);
    assert_eq!(stats.completed, 151);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stalled_steps_do_not_block_other_methods() {
    let (service, mut tokens) = Stalling::new();
    let server = builder()
        .standing(Method::RunStep, 4)
        .serve(service.clone())
        .await
        .unwrap();
    let client = Client::connect(server.local_endpoint()).await.unwrap();

    let mut pending = Vec::new();
    for _ in 0..10 {
        pending.push(
            client
                .start_run_step(&RunStepRequest::default())
                .await
                .unwrap(),
        );
    }
    for _ in 0..10 {
        tokens.recv().await.unwrap();
    }

    let devices = tokio::time::timeout(
        Duration::from_secs(5),
        client.list_devices(&ListDevicesRequest {}),
    )
    .await
    .expect("ListDevices must not wait behind RunStep")
    .unwrap();
    assert!(devices.local_device.is_empty());
    assert_eq!(server.stats().in_flight, 10);
    assert_eq!(server.stats().awaiting_for(Method::RunStep), 4);

    service.release_all(Status::ok());
    for call in pending {
        call.wait().await.unwrap();
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_reaches_stalled_step_without_completing_it() {
    let (service, mut tokens) = Stalling::new();
    let server = builder().serve(service.clone()).await.unwrap();
    let client = Client::connect(server.local_endpoint()).await.unwrap();

    let call = client
        .start_run_step(&RunStepRequest::default())
        .await
        .unwrap();
    let token = tokens.recv().await.unwrap();
    assert!(!token.is_cancelled());

    call.cancel().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("token should observe the client cancel");

    // The service ignored the cancel, so the call is still in flight.
    assert_eq!(server.stats().in_flight, 1);
    let waited = tokio::time::timeout(Duration::from_millis(100), call.wait()).await;
    assert!(waited.is_err(), "no response until the service finishes");

    service.release_all(Status::cancelled("gave up"));
    wait_until(&server, |stats| stats.in_flight == 0).await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_cancels_and_disconnect_are_harmless() {
    let (service, mut tokens) = Stalling::new();
    let server = builder().serve(service.clone()).await.unwrap();
    let client = Client::connect(server.local_endpoint()).await.unwrap();

    let call = client
        .start_run_step(&RunStepRequest::default())
        .await
        .unwrap();
    let token = tokens.recv().await.unwrap();

    call.cancel().await.unwrap();
    call.cancel().await.unwrap();
    token.cancelled().await;
    drop(call);
    drop(client);

    wait_until(&server, |stats| stats.connections == 0).await;
    assert!(token.is_cancelled());

    // Completing after the client left still retires the slot.
    service.release_all(Status::cancelled("client went away"));
    wait_until(&server, |stats| stats.in_flight == 0).await;

    let client = Client::connect(server.local_endpoint()).await.unwrap();
    client.close_session(&CloseSessionRequest::default()).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_cancels_running_step() {
    let (service, mut tokens) = Stalling::new();
    let server = builder().serve(service.clone()).await.unwrap();

    let client = Client::connect(server.local_endpoint()).await.unwrap();
    let call = client
        .start_run_step(&RunStepRequest::default())
        .await
        .unwrap();
    let token = tokens.recv().await.unwrap();

    drop(call);
    drop(client);
    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("disconnect should cancel the step");

    service.release_all(Status::cancelled("disconnected"));
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_honours_cancel() {
    let server = builder().serve(engine(60_000)).await.unwrap();
    let client = Client::connect(server.local_endpoint()).await.unwrap();
    let session = client
        .create_session(&CreateSessionRequest::default())
        .await
        .unwrap()
        .session_handle;

    let call = client
        .start_run_step(&RunStepRequest {
            session_handle: session,
            ..Default::default()
        })
        .await
        .unwrap();
    call.cancel().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), call.wait())
        .await
        .expect("cancelled step should finish promptly");
    assert_eq!(code_of(result), Code::Cancelled);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closing_session_aborts_running_step() {
    let server = builder().serve(engine(60_000)).await.unwrap();
    let client = Client::connect(server.local_endpoint()).await.unwrap();
    let session = client
        .create_session(&CreateSessionRequest::default())
        .await
        .unwrap()
        .session_handle;

    let call = client
        .start_run_step(&RunStepRequest {
            session_handle: session.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    // Give the step time to start before its session goes away.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .close_session(&CloseSessionRequest {
            session_handle: session,
        })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), call.wait())
        .await
        .expect("step should be aborted");
    assert_eq!(code_of(result), Code::Aborted);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_handle_answers_internal() {
    let (tokens, _rx) = mpsc::unbounded_channel();
    let service = Arc::new(Stalling {
        tokens,
        held: Mutex::new(Vec::new()),
        dropped_resets: true,
    });
    let server = builder().serve(service).await.unwrap();
    let client = Client::connect(server.local_endpoint()).await.unwrap();

    let result = client.reset(&ResetRequest::default()).await;
    assert_eq!(code_of(result), Code::Internal);

    // The method was re-armed regardless.
    client.list_devices(&ListDevicesRequest {}).await.unwrap();
    wait_until(&server, |stats| stats.awaiting_for(Method::Reset) == 1).await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_several_workers_share_the_queue() {
    let server = builder().workers(4).serve(engine(1)).await.unwrap();
    let client = Arc::new(Client::connect(server.local_endpoint()).await.unwrap());
    let session = client
        .create_session(&CreateSessionRequest::default())
        .await
        .unwrap()
        .session_handle;

    let done = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..40 {
        let client = client.clone();
        let done = done.clone();
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            client
                .run_step(&RunStepRequest {
                    session_handle: session,
                    ..Default::default()
                })
                .await
                .unwrap();
            client.list_devices(&ListDevicesRequest {}).await.unwrap();
            done.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(done.load(Ordering::Relaxed), 40);

    // Priming happened once even with four workers.
    wait_until(&server, |stats| stats.in_flight == 0).await;
    assert_eq!(server.stats().awaiting_for(Method::RunStep), 100);
    server.shutdown().await.unwrap();
}
