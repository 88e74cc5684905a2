//! End-to-end job runs against the simulated controller and a loopback TCP
//! controller

use async_trait::async_trait;
use nanofab::codec::Codec;
use nanofab::{
    Command, Config, ExecutionEngine, ExposureSpec, Job, JobError, JobRunner, Planner, Point,
    ProcessParameters, ResponseFrame, Session, SessionState, SimulatedTransport, SimulatorHandle,
    Step, Transport, TransportAdapter, TransportConfig, TransportError, TransportKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

fn fast_config() -> Config {
    let mut config = Config::simulated();
    config.session.handshake_timeout_ms = Some(100);
    config.session.ack_timeout_ms = Some(20);
    config.retry.max_attempts = Some(3);
    config.retry.initial_backoff_ms = Some(1);
    config.retry.max_backoff_ms = Some(4);
    config
}

async fn simulated_session(config: &Config) -> (Session, SimulatorHandle) {
    let transport = SimulatedTransport::new().unwrap();
    let handle = transport.handle();
    let mut session = Session::new(TransportAdapter::new(Box::new(transport)), config).unwrap();
    session.connect().await.unwrap();
    (session, handle)
}

fn dot(seconds: f64) -> Step {
    Step::Expose { exposure: ExposureSpec::Duration { seconds } }
}

fn move_to(x: f64, y: f64) -> Step {
    Step::Move { to: Point::new(x, y, 0.0), feed: None }
}

/// move, power, dot, move, dot, dwell
fn dot_pair_job() -> Job {
    Job::new(
        "dot pair",
        vec![
            move_to(10.0, 0.0),
            Step::SetPower { percent: 40.0 },
            dot(0.001),
            move_to(20.0, 0.0),
            dot(0.001),
            Step::Dwell { seconds: 0.001 },
        ],
    )
    .with_origin(Point::default())
    .with_parameters(ProcessParameters {
        feed: Some(10_000.0),
        power: None,
        focus_offset: 0.0,
    })
}

fn count(handle: &SimulatorHandle, opcode: &str) -> usize {
    handle
        .received_commands()
        .iter()
        .filter(|c| c.opcode() == opcode)
        .count()
}

#[tokio::test]
async fn test_two_failed_sends_are_retried_within_budget() {
    let config = fast_config();
    let (mut session, handle) = simulated_session(&config).await;
    handle.fail_sends(2);

    let report = ExecutionEngine::new(&config)
        .execute(&dot_pair_job(), &mut session)
        .await
        .unwrap();

    assert_eq!(report.retries, 2);
    assert_eq!(report.steps_completed, 6);
    // A failed write may have left a partial frame, so each retry follows a reset
    assert_eq!(handle.machine().resets, 2);
    assert_eq!(handle.send_attempts(), handle.received().len() + 2);
}

#[tokio::test]
async fn test_lost_link_aborts_without_retry() {
    let config = fast_config();
    let (mut session, handle) = simulated_session(&config).await;
    handle.sever_link();

    let err = ExecutionEngine::new(&config)
        .execute(&dot_pair_job(), &mut session)
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Aborted { last_step: None, .. }));
    // HELLO, then one ARM and the RESET that tried to recover
    assert_eq!(handle.send_attempts(), 3);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_permanent_timeout_aborts_with_preceding_step() {
    let config = fast_config();
    let (mut session, handle) = simulated_session(&config).await;
    handle.silence_opcode("EXPOSE");

    let err = ExecutionEngine::new(&config)
        .execute(&dot_pair_job(), &mut session)
        .await
        .unwrap_err();

    // Step 2 is the first exposure
    match &err {
        JobError::Aborted { last_step, reason } => {
            assert_eq!(*last_step, Some(1));
            assert!(reason.contains("EXPOSE"));
        }
        other => panic!("expected abort, got {:?}", other),
    }
    assert_eq!(count(&handle, "EXPOSE"), 3);
    assert!(!handle.machine().armed);
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_same_power_exposures_send_one_power_command() {
    let config = fast_config();
    let (mut session, handle) = simulated_session(&config).await;
    ExecutionEngine::new(&config)
        .execute(&dot_pair_job(), &mut session)
        .await
        .unwrap();
    assert_eq!(count(&handle, "POWER"), 1);
    assert_eq!(count(&handle, "EXPOSE"), 2);
}

#[tokio::test]
async fn test_aborted_job_can_be_resumed() {
    let config = fast_config();
    let (mut session, handle) = simulated_session(&config).await;
    let engine = ExecutionEngine::new(&config);

    handle.go_silent_after(5);
    let err = engine.execute(&dot_pair_job(), &mut session).await.unwrap_err();
    let last_step = err.last_step();
    assert_eq!(session.state(), SessionState::Closed);

    // Fresh link to the same controller
    let transport = SimulatedTransport::with_handle(handle.clone()).unwrap();
    let mut session = Session::new(TransportAdapter::new(Box::new(transport)), &config).unwrap();
    handle.go_silent_after(usize::MAX);
    session.connect().await.unwrap();

    let first_step = last_step.map_or(0, |s| s + 1);
    let report = engine.execute_from(&dot_pair_job(), &mut session, first_step).await.unwrap();
    assert_eq!(report.first_step, first_step);
    assert_eq!(report.steps_completed, 6 - first_step);
    assert_eq!(handle.machine().position, nanofab::StagePosition::new(200, 0, 0));
}

#[test]
fn test_plan_is_deterministic() {
    let config = fast_config();
    let planner = Planner::new(config.planner.clone());
    let job = Job::from_yaml(include_str!("../jobs/calibration_grid.yaml")).unwrap();
    assert_eq!(planner.plan(&job).unwrap(), planner.plan(&job).unwrap());
}

#[tokio::test]
async fn test_cancellation_stops_at_command_boundary() {
    let config = fast_config();
    let (session, handle) = simulated_session(&config).await;
    handle.realtime(true);
    let mut steps = vec![move_to(1.0, 1.0)];
    steps.extend((0..20).map(|_| Step::Dwell { seconds: 0.02 }));
    let job = Job::new("long dwell", steps).with_parameters(ProcessParameters {
        feed: Some(10_000.0),
        power: None,
        focus_offset: 0.0,
    });

    let job_handle = JobRunner::spawn(ExecutionEngine::new(&config), job, session, 0);
    tokio::time::sleep(Duration::from_millis(60)).await;
    job_handle.cancel();
    let (session, result) = job_handle.join().await.unwrap();

    match result {
        Err(JobError::Cancelled { last_step }) => {
            let last_step = last_step.unwrap();
            assert!(last_step < 20);
        }
        other => panic!("expected cancellation, got {:?}", other.map(|r| r.steps_completed)),
    }
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.has_outstanding());
    assert!(!handle.machine().armed);
    assert!(count(&handle, "SETTLE") < 20);
}

/// Passes frames through to a simulator while tracking frames in flight
struct CountingTransport {
    inner: SimulatedTransport,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn open(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        self.inner.open(config).await
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.inner.send(frame).await?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&mut self, max_wait: Duration) -> Result<Vec<u8>, TransportError> {
        let frame = self.inner.receive(max_wait).await?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(frame)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn describe(&self) -> String {
        "counting".to_string()
    }
}

#[tokio::test]
async fn test_never_more_than_one_command_in_flight() {
    let config = fast_config();
    let inner = SimulatedTransport::new().unwrap();
    let handle = inner.handle();
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let transport = CountingTransport {
        inner,
        in_flight: Arc::new(AtomicUsize::new(0)),
        max_in_flight: Arc::clone(&max_in_flight),
    };
    let mut session = Session::new(TransportAdapter::new(Box::new(transport)), &config).unwrap();
    session.connect().await.unwrap();

    handle.nack_next(1);
    ExecutionEngine::new(&config)
        .execute(&dot_pair_job(), &mut session)
        .await
        .unwrap();

    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_job_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Minimal controller: acknowledge every command, report a version on HELLO
    let controller = tokio::spawn(async move {
        let codec = Codec::new().unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut received = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            let frame = codec.decode_command(format!("{}\n", line).as_bytes()).unwrap();
            let data = if frame.command == Command::Hello { "TCP-CTRL 2.1" } else { "" };
            let reply = codec.encode_response(&ResponseFrame::ack(frame.id, data));
            write_half.write_all(&reply).await.unwrap();
            received.push(frame.command);
        }
        received
    });

    let mut config = fast_config();
    config.transport = TransportConfig {
        kind: TransportKind::Tcp,
        host: Some("127.0.0.1".to_string()),
        port: Some(port),
        connect_timeout_ms: Some(500),
        ..Default::default()
    };
    config.session.ack_timeout_ms = Some(500);

    let mut session = Session::from_config(&config).unwrap();
    session.connect().await.unwrap();
    assert_eq!(session.machine().firmware_version.as_deref(), Some("TCP-CTRL 2.1"));

    ExecutionEngine::new(&config)
        .execute(&dot_pair_job(), &mut session)
        .await
        .unwrap();
    session.close().await.unwrap();

    let received = controller.await.unwrap();
    assert_eq!(received.first(), Some(&Command::Hello));
    assert_eq!(received.last(), Some(&Command::Disarm));
    assert_eq!(received.len(), 9);
}
