//! # Direct-Mode Pool
//!
//! The dispatcherless wiring: submitted tasks land on a shared pull queue
//! and every connected daemon's worker loop takes the next task whenever
//! its daemon is free. There is no central ordering authority: which
//! daemon serves which task depends on who pulls first, so this mode is
//! documented as **not guaranteed FIFO or least-loaded**. That is the
//! intended trade-off for callers who want no intermediary.
//!
//! What still holds: each daemon carries at most one task at a time, a
//! daemon lost mid-task publishes `TransportLost` on that task, and sticky
//! setup is replayed on every fresh connection.

use crate::task::{cancel_frame, Handle, Task, TaskId, TaskResult};
use crate::transport::{
    Connection, Frame, FrameKind, Listener, TlsMaterial, TransportUrl,
};
use crate::dispatcher::DispatchError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Ctrl {
    Cancel(TaskId),
    Setup(Vec<u8>),
    Shutdown,
}

struct WorkerEntry {
    ctrl: mpsc::UnboundedSender<Ctrl>,
    inflight: Option<TaskId>,
}

struct PoolShared {
    queue: Mutex<VecDeque<(Task, Handle)>>,
    notify: Notify,
    closed: AtomicBool,
    sticky: Mutex<Vec<u8>>,
    workers: Mutex<HashMap<u64, WorkerEntry>>,
    next_worker: AtomicU64,
}

impl PoolShared {
    /// Take the next task, suspending while the queue is empty. `None`
    /// means the pool closed.
    async fn pull(&self) -> Option<(Task, Handle)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(entry) = self.queue.lock().pop_front() {
                return Some(entry);
            }
            notified.await;
        }
    }
}

/// A direct-mode daemon pool for one profile.
pub struct DirectPool {
    shared: Arc<PoolShared>,
    listen_url: TransportUrl,
    expected: usize,
    accept: JoinHandle<()>,
}

impl DirectPool {
    /// Bind the shared listen URL and start accepting daemons.
    pub async fn start(
        url: &TransportUrl,
        tls: Option<TlsMaterial>,
        expected: usize,
    ) -> Result<Self, DispatchError> {
        let listener = Listener::bind(url, tls.as_ref()).await?;
        let listen_url = listener.local_url().clone();
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            sticky: Mutex::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
            next_worker: AtomicU64::new(1),
        });
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        info!("direct pool listening on {}", listen_url);
        Ok(Self {
            shared,
            listen_url,
            expected,
            accept,
        })
    }

    pub fn listen_url(&self) -> &TransportUrl {
        &self.listen_url
    }

    /// Number of daemons the profile was configured for; used for launch
    /// command emission and status reporting.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Enqueue a task for whichever daemon pulls first.
    pub fn submit(&self, task: Task, handle: Handle) {
        if self.shared.closed.load(Ordering::Acquire) {
            handle.resolve(TaskResult::Canceled);
            return;
        }
        self.shared.queue.lock().push_back((task, handle));
        self.shared.notify.notify_waiters();
    }

    /// Cancel a queued or in-flight task. The caller resolves the handle.
    pub fn cancel(&self, task_id: TaskId) {
        {
            let mut queue = self.shared.queue.lock();
            if let Some(pos) = queue.iter().position(|(t, _)| t.task_id == task_id) {
                let (_, handle) = queue.remove(pos).expect("position valid");
                handle.resolve(TaskResult::Canceled);
                return;
            }
        }
        let workers = self.shared.workers.lock();
        for entry in workers.values() {
            if entry.inflight == Some(task_id) {
                let _ = entry.ctrl.send(Ctrl::Cancel(task_id));
                return;
            }
        }
    }

    /// Replace the sticky payload; connected idle daemons get it now,
    /// busy ones after their current task, future daemons on connect.
    pub fn everywhere(&self, payload: Vec<u8>) {
        *self.shared.sticky.lock() = payload.clone();
        for entry in self.shared.workers.lock().values() {
            let _ = entry.ctrl.send(Ctrl::Setup(payload.clone()));
        }
    }

    /// Live connection count and the configured daemon URL list.
    pub fn status(&self) -> (usize, Vec<String>) {
        let connections = self.shared.workers.lock().len();
        (
            connections,
            vec![self.listen_url.to_string(); self.expected.max(1)],
        )
    }

    /// Close the pool: flush queued tasks as `Canceled`, tell every daemon
    /// to shut down, stop accepting.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        self.accept.abort();

        for (_, handle) in self.shared.queue.lock().drain(..) {
            handle.resolve(TaskResult::Canceled);
        }
        let workers: Vec<_> = self
            .shared
            .workers
            .lock()
            .values()
            .map(|w| w.ctrl.clone())
            .collect();
        for ctrl in workers {
            let _ = ctrl.send(Ctrl::Shutdown);
        }
        // Grace period for shutdown frames to reach the wire.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

async fn accept_loop(listener: Listener, shared: Arc<PoolShared>) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let id = shared.next_worker.fetch_add(1, Ordering::Relaxed);
                let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
                shared.workers.lock().insert(
                    id,
                    WorkerEntry {
                        ctrl: ctrl_tx,
                        inflight: None,
                    },
                );
                debug!("daemon connected to direct pool as worker {}", id);
                tokio::spawn(worker(conn, ctrl_rx, Arc::clone(&shared), id));
            }
            Err(e) => debug!("direct pool accept failed: {}", e),
        }
    }
}

/// One connected daemon: handshake, then pull-evaluate until the pool
/// closes or the connection drops.
async fn worker(
    mut conn: Connection,
    mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
    shared: Arc<PoolShared>,
    id: u64,
) {
    // Handshake: sticky setup, ack expected before the first pull.
    let sticky = shared.sticky.lock().clone();
    if conn.send(&Frame::bare(FrameKind::Setup, sticky)).await.is_err()
        || conn.recv().await.is_err()
    {
        shared.workers.lock().remove(&id);
        return;
    }

    loop {
        tokio::select! {
            pulled = shared.pull() => {
                match pulled {
                    None => break, // pool closed
                    Some((task, handle)) => {
                        if handle.poll().is_some() {
                            continue; // canceled or timed out while queued
                        }
                        match serve_task(&mut conn, &mut ctrl_rx, &shared, id, task, handle).await {
                            TaskExit::Continue => {}
                            TaskExit::Stop => break,
                            TaskExit::Lost => {
                                shared.workers.lock().remove(&id);
                                return;
                            }
                        }
                    }
                }
            }
            ctrl = ctrl_rx.recv() => {
                match ctrl {
                    Some(Ctrl::Setup(payload)) => {
                        // Idle: push the new sticky payload and wait for
                        // the ack so it cannot masquerade as a result.
                        if conn.send(&Frame::bare(FrameKind::Setup, payload)).await.is_err()
                            || conn.recv().await.is_err()
                        {
                            shared.workers.lock().remove(&id);
                            return;
                        }
                    }
                    Some(Ctrl::Cancel(_)) => {} // nothing in flight
                    Some(Ctrl::Shutdown) | None => break,
                }
            }
        }
    }

    let _ = conn.send(&Frame::bare(FrameKind::Shutdown, Vec::new())).await;
    conn.close().await;
    shared.workers.lock().remove(&id);
    debug!("direct pool worker {} stopped", id);
}

enum TaskExit {
    Continue,
    Stop,
    Lost,
}

async fn serve_task(
    conn: &mut Connection,
    ctrl_rx: &mut mpsc::UnboundedReceiver<Ctrl>,
    shared: &Arc<PoolShared>,
    id: u64,
    task: Task,
    handle: Handle,
) -> TaskExit {
    if conn.send(&task.to_frame()).await.is_err() {
        handle.resolve(TaskResult::TransportLost);
        return TaskExit::Lost;
    }
    if let Some(entry) = shared.workers.lock().get_mut(&id) {
        entry.inflight = Some(task.task_id);
    }
    let mut pending_setup: Option<Vec<u8>> = None;
    let mut stop_after = false;

    let exit = loop {
        tokio::select! {
            inbound = conn.recv() => {
                match inbound {
                    Ok(frame) => {
                        if let Some(result) = TaskResult::from_result_frame(frame) {
                            if !handle.resolve(result) {
                                debug!("late result for {} dropped", task.task_id);
                            }
                            break if stop_after { TaskExit::Stop } else { TaskExit::Continue };
                        }
                        debug!("non-result frame from busy worker {}", id);
                    }
                    Err(_) => {
                        warn!("worker {} lost with task {} in flight", id, task.task_id);
                        handle.resolve(TaskResult::TransportLost);
                        break TaskExit::Lost;
                    }
                }
            }
            ctrl = ctrl_rx.recv() => {
                match ctrl {
                    Some(Ctrl::Cancel(target)) if target == task.task_id => {
                        let _ = conn.send(&cancel_frame(target)).await;
                        handle.resolve(TaskResult::Canceled);
                        // Keep waiting: the daemon answers with an
                        // interrupt (or its result), which we drop.
                    }
                    Some(Ctrl::Cancel(_)) => {}
                    Some(Ctrl::Setup(payload)) => pending_setup = Some(payload),
                    Some(Ctrl::Shutdown) | None => stop_after = true,
                }
            }
        }
    };

    if let Some(entry) = shared.workers.lock().get_mut(&id) {
        entry.inflight = None;
    }
    if let (TaskExit::Continue, Some(payload)) = (&exit, pending_setup) {
        if conn.send(&Frame::bare(FrameKind::Setup, payload)).await.is_err()
            || conn.recv().await.is_err()
        {
            return TaskExit::Lost;
        }
    }
    exit
}
