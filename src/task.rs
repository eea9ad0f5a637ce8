//! # Task, Result, and Handle Model
//!
//! A [`Task`] is an opaque payload plus side-channel extension entries,
//! immutable once submitted. Its outcome is a [`TaskResult`], which carries
//! every failure mode as a first-class value: remote-origin failures never
//! cross the public boundary as errors, they arrive as typed variants
//! attached to the caller's [`Handle`].
//!
//! The handle is the caller-held future-like reference. It resolves exactly
//! once (`Pending → Resolved`); later completion attempts are dropped, which
//! is what makes the timeout-vs-result and cancel-vs-result races safe.

use crate::transport::{Frame, FrameKind};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

/// Opaque unique task identifier.
pub type TaskId = Uuid;

/// A unit of work queued for a daemon. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: TaskId,
    /// Opaque payload bytes; the core never inspects them.
    pub payload: Vec<u8>,
    /// Ordered `(class_tag, blob)` side-channel entries produced by the
    /// codec registry at submit time.
    pub extensions: Vec<(String, Vec<u8>)>,
    /// Host-side deadline; expiry resolves the handle to `Timeout`.
    pub timeout: Option<Duration>,
    /// Name of the compute profile this task is bound to.
    pub profile: String,
    pub submitted_at: Instant,
}

impl Task {
    pub fn new(
        payload: Vec<u8>,
        extensions: Vec<(String, Vec<u8>)>,
        timeout: Option<Duration>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            payload,
            extensions,
            timeout,
            profile: profile.into(),
            submitted_at: Instant::now(),
        }
    }

    /// The wire frame delivering this task to a daemon.
    ///
    /// The frame payload is the 16-byte task id followed by the opaque
    /// caller payload; cancel control frames carry the same id, which is
    /// how a daemon matches a cancel against its in-flight task.
    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::with_capacity(16 + self.payload.len());
        payload.extend_from_slice(self.task_id.as_bytes());
        payload.extend_from_slice(&self.payload);
        Frame {
            kind: FrameKind::Task,
            payload,
            extensions: self.extensions.clone(),
        }
    }
}

/// Split a task frame into its id, the opaque caller payload, and the
/// extension entries.
pub fn task_frame_parts(
    frame: Frame,
) -> Result<(TaskId, Vec<u8>, Vec<(String, Vec<u8>)>), crate::transport::TransportError> {
    if frame.payload.len() < 16 {
        return Err(crate::transport::TransportError::MalformedFrame(
            "task frame shorter than its id prefix",
        ));
    }
    let id = Uuid::from_slice(&frame.payload[..16])
        .map_err(|_| crate::transport::TransportError::MalformedFrame("bad task id"))?;
    Ok((id, frame.payload[16..].to_vec(), frame.extensions))
}

/// Build the cancel control frame for a task.
pub fn cancel_frame(task_id: TaskId) -> Frame {
    Frame::bare(FrameKind::Cancel, task_id.as_bytes().to_vec())
}

/// The task id a cancel control frame targets, if well-formed.
pub fn cancel_frame_id(frame: &Frame) -> Option<TaskId> {
    Uuid::from_slice(&frame.payload).ok()
}

/// Body of a `ResultErr` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EvalErrorBody {
    message: String,
    stack: Vec<String>,
}

/// Outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// Successful evaluation: result payload plus codec side-channel data.
    Ok {
        payload: Vec<u8>,
        extensions: Vec<(String, Vec<u8>)>,
    },
    /// The evaluator failed; message plus captured stack frames.
    EvalError { message: String, stack: Vec<String> },
    /// Evaluation was interrupted on the daemon.
    Interrupt,
    /// The host-side deadline expired before a result arrived.
    Timeout,
    /// The caller canceled the task.
    Canceled,
    /// The connection carrying the in-flight task was lost.
    TransportLost,
}

/// Numeric sentinel: timed out.
pub const ERROR_VALUE_TIMEOUT: u8 = 5;
/// Numeric sentinel: connection reset.
pub const ERROR_VALUE_CONNECTION_RESET: u8 = 7;
/// Numeric sentinel: aborted.
pub const ERROR_VALUE_ABORTED: u8 = 19;
/// Numeric sentinel: canceled.
pub const ERROR_VALUE_CANCELED: u8 = 20;

impl TaskResult {
    /// True for evaluation failures reported by the daemon.
    pub fn is_eval_error(&self) -> bool {
        matches!(self, TaskResult::EvalError { .. })
    }

    /// True when evaluation was interrupted.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, TaskResult::Interrupt)
    }

    /// Union predicate: true for every non-`Ok` outcome.
    pub fn is_error_value(&self) -> bool {
        !matches!(self, TaskResult::Ok { .. })
    }

    /// Transport-level numeric sentinel for the outcome, where one is
    /// defined: 5 timed out, 7 connection reset, 19 aborted, 20 canceled.
    pub fn error_value(&self) -> Option<u8> {
        match self {
            TaskResult::Timeout => Some(ERROR_VALUE_TIMEOUT),
            TaskResult::TransportLost => Some(ERROR_VALUE_CONNECTION_RESET),
            TaskResult::Interrupt => Some(ERROR_VALUE_ABORTED),
            TaskResult::Canceled => Some(ERROR_VALUE_CANCELED),
            _ => None,
        }
    }

    /// Encode a daemon-produced outcome as its wire frame. Host-local
    /// outcomes (`Timeout`, `Canceled`, `TransportLost`) never travel and
    /// yield `None`.
    pub fn to_result_frame(&self) -> Option<Frame> {
        match self {
            TaskResult::Ok {
                payload,
                extensions,
            } => Some(Frame {
                kind: FrameKind::ResultOk,
                payload: payload.clone(),
                extensions: extensions.clone(),
            }),
            TaskResult::EvalError { message, stack } => {
                let body = EvalErrorBody {
                    message: message.clone(),
                    stack: stack.clone(),
                };
                Some(Frame::bare(
                    FrameKind::ResultErr,
                    bincode::serialize(&body).expect("error body serializes"),
                ))
            }
            TaskResult::Interrupt => Some(Frame::bare(FrameKind::ResultInterrupt, Vec::new())),
            _ => None,
        }
    }

    /// Decode a result frame received from a daemon.
    pub fn from_result_frame(frame: Frame) -> Option<TaskResult> {
        match frame.kind {
            FrameKind::ResultOk => Some(TaskResult::Ok {
                payload: frame.payload,
                extensions: frame.extensions,
            }),
            FrameKind::ResultErr => {
                let body: EvalErrorBody = bincode::deserialize(&frame.payload).unwrap_or_else(|_| {
                    EvalErrorBody {
                        message: "malformed error body".to_string(),
                        stack: Vec::new(),
                    }
                });
                Some(TaskResult::EvalError {
                    message: body.message,
                    stack: body.stack,
                })
            }
            FrameKind::ResultInterrupt => Some(TaskResult::Interrupt),
            _ => None,
        }
    }
}

/// Handle state as observed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Pending,
    Resolved,
    Canceled,
}

/// Deadline elapsed while waiting on a handle.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("deadline exceeded waiting for task result")]
pub struct DeadlineExceeded;

struct HandleShared {
    task_id: TaskId,
    profile: String,
    result: Mutex<Option<TaskResult>>,
    notify: Notify,
}

/// Caller-held reference to a pending or resolved task.
///
/// Clones share the same underlying slot. Reads are thread-safe; the
/// completion path is the single logical writer and the first resolution
/// wins.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleShared>,
}

impl Handle {
    pub fn new(task_id: TaskId, profile: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleShared {
                task_id,
                profile: profile.into(),
                result: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    /// The profile the task was submitted against.
    pub fn profile(&self) -> &str {
        &self.inner.profile
    }

    /// Non-blocking check: the result once resolved, identical on every
    /// subsequent call.
    pub fn poll(&self) -> Option<TaskResult> {
        self.inner.result.lock().expect("handle lock").clone()
    }

    pub fn state(&self) -> HandleState {
        match self.poll() {
            None => HandleState::Pending,
            Some(TaskResult::Canceled) => HandleState::Canceled,
            Some(_) => HandleState::Resolved,
        }
    }

    /// Resolve the handle. Returns true if this call performed the
    /// `Pending → Resolved` transition; later attempts leave the stored
    /// result untouched.
    pub(crate) fn resolve(&self, result: TaskResult) -> bool {
        let mut slot = self.inner.result.lock().expect("handle lock");
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        drop(slot);
        self.inner.notify.notify_waiters();
        true
    }

    /// Suspend until the handle resolves.
    pub async fn wait(&self) -> TaskResult {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a resolve landing
            // between the check and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(result) = self.poll() {
                return result;
            }
            notified.await;
        }
    }

    /// Suspend until the handle resolves or `limit` elapses.
    pub async fn wait_for(&self, limit: Duration) -> Result<TaskResult, DeadlineExceeded> {
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| DeadlineExceeded)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("task_id", &self.inner.task_id)
            .field("state", &self.state())
            .finish()
    }
}
