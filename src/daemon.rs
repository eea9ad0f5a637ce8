//! # Daemon Process Module
//!
//! A daemon is a long-lived worker that dials the host, performs the
//! sticky-setup handshake, and then evaluates tasks one at a time, never
//! interleaving two evaluations. The language-level evaluator is an
//! external collaborator behind the [`Evaluator`] trait; this crate ships
//! [`EchoEvaluator`] and [`SleepEvaluator`] for smoke tests and pool
//! bring-up checks.
//!
//! Lifecycle:
//!
//! 1. Dial the configured URL with bounded-backoff redial.
//! 2. One-time handshake: receive the sticky-setup frame (possibly empty),
//!    apply it, ack.
//! 3. Serve loop: task frames are evaluated; a cancel frame matching the
//!    in-flight task id aborts the evaluation and reports an interrupt;
//!    setup frames re-apply sticky state; a shutdown frame exits cleanly.
//! 4. On transport loss: exit with an error when `autoexit` is set,
//!    otherwise wait indefinitely, re-dialing the same URL.
//!
//! Evaluator panics are contained per task and reported as evaluation
//! errors; the daemon keeps serving.

use crate::task::{cancel_frame_id, task_frame_parts, TaskId, TaskResult};
use crate::transport::{self, tls, Frame, FrameKind, TransportError, TransportUrl};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long the initial dial keeps retrying before giving up when
/// `autoexit` applies. Reconnection after loss without `autoexit` is
/// effectively unbounded.
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Outcome of one evaluation, as produced by the evaluator itself.
/// Interrupts and transport outcomes are the daemon's business, not the
/// evaluator's.
#[derive(Debug, Clone)]
pub enum Evaluation {
    Ok {
        payload: Vec<u8>,
        extensions: Vec<(String, Vec<u8>)>,
    },
    Error {
        message: String,
        stack: Vec<String>,
    },
}

/// The pluggable evaluation seam.
///
/// Implementations must be cancel-safe at await points: the daemon aborts
/// the evaluation future when a matching cancel frame arrives.
#[async_trait]
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluate one task payload. Must not be called concurrently by the
    /// daemon; one task at a time is a protocol invariant.
    async fn evaluate(&self, payload: Vec<u8>, extensions: Vec<(String, Vec<u8>)>) -> Evaluation;

    /// Apply a sticky-setup payload. State established here persists
    /// across tasks; re-application must be idempotent.
    async fn apply_setup(&self, _payload: Vec<u8>) -> Result<(), String> {
        Ok(())
    }

    /// Seed worker-side randomness for cluster-reproducible runs.
    fn seed(&self, _seed: u64) {}
}

/// Echoes every task back unchanged. The reference evaluator for
/// connectivity checks and tests.
#[derive(Debug, Default)]
pub struct EchoEvaluator;

#[async_trait]
impl Evaluator for EchoEvaluator {
    async fn evaluate(&self, payload: Vec<u8>, extensions: Vec<(String, Vec<u8>)>) -> Evaluation {
        Evaluation::Ok {
            payload,
            extensions,
        }
    }
}

/// Sleeps for the big-endian millisecond count in the first 8 payload
/// bytes, then echoes. Used by scheduling and timeout tests.
#[derive(Debug, Default)]
pub struct SleepEvaluator;

impl SleepEvaluator {
    /// Encode a payload for this evaluator.
    pub fn payload(millis: u64) -> Vec<u8> {
        millis.to_be_bytes().to_vec()
    }
}

#[async_trait]
impl Evaluator for SleepEvaluator {
    async fn evaluate(&self, payload: Vec<u8>, extensions: Vec<(String, Vec<u8>)>) -> Evaluation {
        if payload.len() >= 8 {
            let millis = u64::from_be_bytes(payload[..8].try_into().expect("fixed slice"));
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        Evaluation::Ok {
            payload,
            extensions,
        }
    }
}

/// Daemon start parameters, mirroring the CLI surface.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Host URL to dial.
    pub url: TransportUrl,
    /// Certificate PEM to trust when the URL activates TLS.
    pub tls_cert_pem: Option<String>,
    /// Exit on transport loss instead of waiting for reconnection.
    pub autoexit: bool,
    /// RNG seed forwarded to the evaluator.
    pub seed: Option<u64>,
}

impl DaemonConfig {
    pub fn new(url: TransportUrl) -> Self {
        Self {
            url,
            tls_cert_pem: None,
            autoexit: true,
            seed: None,
        }
    }
}

/// Run a daemon until shutdown.
///
/// Returns `Ok(())` on an orderly shutdown frame. Returns the transport
/// error when the connection is lost and `autoexit` is set; without
/// `autoexit` the daemon re-dials indefinitely.
pub async fn serve(
    config: DaemonConfig,
    evaluator: Arc<dyn Evaluator>,
) -> Result<(), TransportError> {
    if let Some(seed) = config.seed {
        evaluator.seed(seed);
    }

    let client_tls = match (config.url.uses_tls(), &config.tls_cert_pem) {
        (true, Some(pem)) => Some(tls::client_config(pem)?),
        (true, None) => return Err(TransportError::TlsRequired),
        _ => None,
    };

    let mut dial_timeout = DIAL_TIMEOUT;
    loop {
        let mut conn =
            transport::dial_with_retry(&config.url, client_tls.as_ref(), dial_timeout).await?;
        info!("connected to {}", config.url);

        match serve_connection(&mut conn, &evaluator).await {
            Ok(()) => {
                conn.close().await;
                info!("shutdown frame received, exiting cleanly");
                return Ok(());
            }
            Err(e) if config.autoexit => {
                warn!("transport lost ({}), autoexit", e);
                return Err(e);
            }
            Err(e) => {
                info!("transport lost ({}), waiting for reconnection", e);
                dial_timeout = RECONNECT_TIMEOUT;
            }
        }
    }
}

/// Spawn an in-process daemon on the current runtime. Used by scoped local
/// pools and tests; remote deployments run the `taskgrid-daemon` binary.
pub fn spawn_local(
    config: DaemonConfig,
    evaluator: Arc<dyn Evaluator>,
) -> JoinHandle<Result<(), TransportError>> {
    tokio::spawn(serve(config, evaluator))
}

/// Serve one connection to completion. `Ok(())` means orderly shutdown;
/// an error means the transport dropped.
async fn serve_connection(
    conn: &mut transport::Connection,
    evaluator: &Arc<dyn Evaluator>,
) -> Result<(), TransportError> {
    // One-time handshake: the host opens with the current sticky-setup
    // payload, which may be empty.
    let first = conn.recv().await?;
    match first.kind {
        FrameKind::Setup => {
            apply_setup(conn, evaluator, first.payload).await?;
        }
        FrameKind::Shutdown => return Ok(()),
        other => {
            warn!("expected setup handshake, got {:?}", other);
            return Err(TransportError::MalformedFrame(
                "handshake must open with a setup frame",
            ));
        }
    }

    loop {
        let frame = conn.recv().await?;
        match frame.kind {
            FrameKind::Task => {
                let (task_id, payload, extensions) = task_frame_parts(frame)?;
                if !run_task(conn, evaluator, task_id, payload, extensions).await? {
                    return Ok(());
                }
            }
            FrameKind::Setup => {
                apply_setup(conn, evaluator, frame.payload).await?;
            }
            FrameKind::Cancel => {
                // Nothing in flight; the task already finished.
                debug!("stale cancel for {:?}", cancel_frame_id(&frame));
            }
            FrameKind::Shutdown => return Ok(()),
            other => debug!("ignoring unexpected frame {:?}", other),
        }
    }
}

async fn apply_setup(
    conn: &mut transport::Connection,
    evaluator: &Arc<dyn Evaluator>,
    payload: Vec<u8>,
) -> Result<(), TransportError> {
    if let Err(message) = evaluator.apply_setup(payload).await {
        warn!("sticky setup failed: {}", message);
        let result = TaskResult::EvalError {
            message,
            stack: Vec::new(),
        };
        conn.send(&result.to_result_frame().expect("eval error travels"))
            .await?;
    } else {
        conn.send(&Frame::bare(FrameKind::ResultOk, Vec::new())).await?;
    }
    Ok(())
}

/// Evaluate one task while staying responsive to control frames.
///
/// Returns `Ok(true)` to keep serving, `Ok(false)` on shutdown.
async fn run_task(
    conn: &mut transport::Connection,
    evaluator: &Arc<dyn Evaluator>,
    task_id: TaskId,
    payload: Vec<u8>,
    extensions: Vec<(String, Vec<u8>)>,
) -> Result<bool, TransportError> {
    let mut eval = {
        let evaluator = Arc::clone(evaluator);
        tokio::spawn(async move { evaluator.evaluate(payload, extensions).await })
    };

    loop {
        tokio::select! {
            joined = &mut eval => {
                let result = match joined {
                    Ok(Evaluation::Ok { payload, extensions }) => TaskResult::Ok {
                        payload,
                        extensions,
                    },
                    Ok(Evaluation::Error { message, stack }) => TaskResult::EvalError {
                        message,
                        stack,
                    },
                    Err(join_err) if join_err.is_cancelled() => TaskResult::Interrupt,
                    Err(join_err) => TaskResult::EvalError {
                        message: panic_message(join_err),
                        stack: Vec::new(),
                    },
                };
                let frame = result.to_result_frame().expect("daemon outcome travels");
                conn.send(&frame).await?;
                return Ok(true);
            }
            inbound = conn.recv() => {
                let frame = match inbound {
                    Ok(frame) => frame,
                    Err(e) => {
                        eval.abort();
                        return Err(e);
                    }
                };
                match frame.kind {
                    FrameKind::Cancel if cancel_frame_id(&frame) == Some(task_id) => {
                        debug!("cancel matched in-flight task {}", task_id);
                        eval.abort();
                        // The aborted join resolves on the next loop turn
                        // and reports the interrupt.
                    }
                    FrameKind::Cancel => {
                        debug!("cancel for a task not in flight, ignoring");
                    }
                    FrameKind::Setup => {
                        // The host only pushes setup to idle daemons; this
                        // is a robustness path. Apply without acking so the
                        // peer cannot mistake the ack for a task result.
                        let _ = evaluator.apply_setup(frame.payload).await;
                    }
                    FrameKind::Shutdown => {
                        eval.abort();
                        return Ok(false);
                    }
                    other => debug!("ignoring {:?} during evaluation", other),
                }
            }
        }
    }
}

fn panic_message(join_err: tokio::task::JoinError) -> String {
    let panic = join_err.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("evaluator panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("evaluator panicked: {s}")
    } else {
        "evaluator panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::transport::Listener;

    async fn connect_pair(sticky: Vec<u8>) -> (transport::Connection, JoinHandle<Result<(), TransportError>>) {
        let url = TransportUrl::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&url, None).await.unwrap();
        let dial_url = listener.local_url().clone();
        let daemon = spawn_local(
            DaemonConfig::new(dial_url),
            Arc::new(EchoEvaluator),
        );
        let mut conn = listener.accept().await.unwrap();
        conn.send(&Frame::bare(FrameKind::Setup, sticky)).await.unwrap();
        let ack = conn.recv().await.unwrap();
        assert_eq!(ack.kind, FrameKind::ResultOk);
        (conn, daemon)
    }

    /// Handshake, one echo round-trip, orderly shutdown with exit Ok.
    #[tokio::test]
    async fn echo_round_trip_and_clean_shutdown() {
        let (mut conn, daemon) = connect_pair(Vec::new()).await;

        let task = Task::new(b"hello".to_vec(), Vec::new(), None, "default");
        conn.send(&task.to_frame()).await.unwrap();
        let reply = conn.recv().await.unwrap();
        assert_eq!(reply.kind, FrameKind::ResultOk);
        assert_eq!(reply.payload, b"hello");

        conn.send(&Frame::bare(FrameKind::Shutdown, Vec::new())).await.unwrap();
        assert!(daemon.await.unwrap().is_ok());
    }

    /// A matching cancel interrupts the evaluation; the daemon reports the
    /// interrupt and keeps serving the next task.
    #[tokio::test]
    async fn cancel_interrupts_in_flight_task() {
        let url = TransportUrl::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&url, None).await.unwrap();
        let daemon = spawn_local(
            DaemonConfig::new(listener.local_url().clone()),
            Arc::new(SleepEvaluator),
        );
        let mut conn = listener.accept().await.unwrap();
        conn.send(&Frame::bare(FrameKind::Setup, Vec::new())).await.unwrap();
        conn.recv().await.unwrap();

        let slow = Task::new(SleepEvaluator::payload(60_000), Vec::new(), None, "default");
        conn.send(&slow.to_frame()).await.unwrap();
        conn.send(&crate::task::cancel_frame(slow.task_id)).await.unwrap();

        let reply = conn.recv().await.unwrap();
        assert_eq!(reply.kind, FrameKind::ResultInterrupt);

        // Still serving.
        let quick = Task::new(SleepEvaluator::payload(0), Vec::new(), None, "default");
        conn.send(&quick.to_frame()).await.unwrap();
        assert_eq!(conn.recv().await.unwrap().kind, FrameKind::ResultOk);

        conn.send(&Frame::bare(FrameKind::Shutdown, Vec::new())).await.unwrap();
        assert!(daemon.await.unwrap().is_ok());
    }

    /// An evaluator panic becomes an evaluation error, not a dead daemon.
    #[tokio::test]
    async fn panic_is_contained_as_eval_error() {
        struct Panicker;
        #[async_trait]
        impl Evaluator for Panicker {
            async fn evaluate(
                &self,
                _payload: Vec<u8>,
                _extensions: Vec<(String, Vec<u8>)>,
            ) -> Evaluation {
                panic!("deliberate failure");
            }
        }

        let url = TransportUrl::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&url, None).await.unwrap();
        let daemon = spawn_local(DaemonConfig::new(listener.local_url().clone()), Arc::new(Panicker));
        let mut conn = listener.accept().await.unwrap();
        conn.send(&Frame::bare(FrameKind::Setup, Vec::new())).await.unwrap();
        conn.recv().await.unwrap();

        let task = Task::new(Vec::new(), Vec::new(), None, "default");
        conn.send(&task.to_frame()).await.unwrap();
        let reply = conn.recv().await.unwrap();
        assert_eq!(reply.kind, FrameKind::ResultErr);
        match TaskResult::from_result_frame(reply).unwrap() {
            TaskResult::EvalError { message, .. } => {
                assert!(message.contains("deliberate failure"));
            }
            other => panic!("unexpected result {other:?}"),
        }

        conn.send(&Frame::bare(FrameKind::Shutdown, Vec::new())).await.unwrap();
        assert!(daemon.await.unwrap().is_ok());
    }

    /// With autoexit set, dropping the host connection ends the daemon
    /// with a transport error.
    #[tokio::test]
    async fn autoexit_on_transport_loss() {
        let (conn, daemon) = connect_pair(Vec::new()).await;
        drop(conn);
        assert!(daemon.await.unwrap().is_err());
    }

    /// The sticky-setup handshake reaches the evaluator before any task.
    #[tokio::test]
    async fn sticky_setup_is_applied_on_connect() {
        use std::sync::Mutex;
        struct Recorder(Mutex<Vec<Vec<u8>>>);
        #[async_trait]
        impl Evaluator for Recorder {
            async fn evaluate(
                &self,
                payload: Vec<u8>,
                extensions: Vec<(String, Vec<u8>)>,
            ) -> Evaluation {
                Evaluation::Ok { payload, extensions }
            }
            async fn apply_setup(&self, payload: Vec<u8>) -> Result<(), String> {
                self.0.lock().expect("recorder lock").push(payload);
                Ok(())
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let url = TransportUrl::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&url, None).await.unwrap();
        let daemon = spawn_local(
            DaemonConfig::new(listener.local_url().clone()),
            recorder.clone() as Arc<dyn Evaluator>,
        );
        let mut conn = listener.accept().await.unwrap();
        conn.send(&Frame::bare(FrameKind::Setup, b"library(setup)".to_vec()))
            .await
            .unwrap();
        conn.recv().await.unwrap();

        assert_eq!(
            *recorder.0.lock().expect("recorder lock"),
            vec![b"library(setup)".to_vec()]
        );

        conn.send(&Frame::bare(FrameKind::Shutdown, Vec::new())).await.unwrap();
        assert!(daemon.await.unwrap().is_ok());
    }
}
