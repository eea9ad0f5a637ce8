//! # Dispatcher Module
//!
//! The optional intermediary between submission and the daemon pool. It
//! owns the FIFO queue of pending tasks and the roster of daemon records,
//! and enforces the scheduling contract: assignment order matches
//! submission order, each task goes to the least-loaded idle daemon (ties
//! to the lowest slot index), and at most one task is in flight per daemon.
//!
//! ## Structure
//!
//! All mutable state lives in a single event-loop task per profile. Each
//! daemon slot has its own listen URL; a slot task accepts one connection
//! at a time and pumps frames between the socket and the event loop, so
//! the loop itself never blocks on I/O. Commands from the host and events
//! from slot tasks arrive on channels; after every message the loop
//! re-checks the "queue nonempty and somebody idle" condition and
//! dispatches as far as it can.
//!
//! ## Membership
//!
//! Fresh connections are handshaken with the current sticky-setup payload
//! and join the idle set only after the ack. A daemon lost while idle just
//! goes offline; one lost mid-task additionally publishes `TransportLost`
//! on its task; the task is deliberately not requeued, so non-idempotent
//! work is never silently retried. URL regeneration (`saisei`) rebinds the
//! slot's listener, flips the instance counter negative, and invalidates
//! whatever was connected; the counter goes positive again on the next
//! connect.

use crate::codec::CodecError;
use crate::task::{cancel_frame, Handle, Task, TaskId, TaskResult};
use crate::transport::{
    Frame, FrameKind, Listener, TlsMaterial, TransportError, TransportUrl,
};
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Dispatch-layer failures surfaced to the host API. Remote-origin task
/// failures are never here; they resolve handles instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no such daemon slot {0}")]
    NoSuchSlot(usize),

    #[error("unknown profile {0:?}")]
    UnknownProfile(String),

    #[error("profile has been shut down")]
    Closed,

    #[error("operation requires a dispatcher-mediated profile")]
    NotMediated,

    #[error("slot port arithmetic overflowed for base port {0}")]
    PortOverflow(u16),
}

/// One row of the status matrix.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonRow {
    pub i: usize,
    pub url: String,
    pub online: u8,
    pub instance: i64,
    pub assigned: u64,
    pub complete: u64,
}

/// Snapshot of a dispatcher's roster.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub connections: usize,
    pub daemons: Vec<DaemonRow>,
}

enum Command {
    Submit { task: Task, handle: Handle },
    Cancel { task_id: TaskId },
    Everywhere { payload: Vec<u8> },
    Saisei {
        slot: usize,
        reply: oneshot::Sender<Result<TransportUrl, DispatchError>>,
    },
    Status { reply: oneshot::Sender<DispatcherStatus> },
    Shutdown { reply: oneshot::Sender<()> },
}

enum Event {
    Connected {
        slot: usize,
        generation: u64,
        outbound: mpsc::UnboundedSender<Frame>,
    },
    Inbound {
        slot: usize,
        generation: u64,
        frame: Frame,
    },
    Disconnected { slot: usize, generation: u64 },
}

/// Host-side handle to a running dispatcher event loop.
pub struct Dispatcher {
    cmd_tx: mpsc::UnboundedSender<Command>,
    daemon_urls: Vec<TransportUrl>,
}

impl Dispatcher {
    /// Bind one listener per daemon slot and start the event loop.
    ///
    /// Slot addresses derive from `base_url`: an explicit TCP port is used
    /// as `port + i`, port 0 gives every slot its own ephemeral port, and
    /// path-like URLs get an index suffix. Bind failures (invalid URL,
    /// port taken) surface here, before any daemon is launched.
    pub async fn start(
        n: usize,
        base_url: &TransportUrl,
        tls: Option<TlsMaterial>,
    ) -> Result<Self, DispatchError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut slots = Vec::with_capacity(n);
        let mut daemon_urls = Vec::with_capacity(n);

        for i in 0..n {
            let url = slot_url(base_url, i)?;
            let listener = Listener::bind(&url, tls.as_ref()).await?;
            let local = listener.local_url().clone();
            daemon_urls.push(local.clone());
            let pump = tokio::spawn(slot_task(i, 0, listener, event_tx.clone()));
            slots.push(Slot::new(local, pump));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            EventLoop {
                slots,
                queue: VecDeque::new(),
                sticky: Vec::new(),
                tls,
                event_tx,
            }
            .run(cmd_rx, event_rx),
        );

        info!("dispatcher started with {} daemon slots", n);
        Ok(Self {
            cmd_tx,
            daemon_urls,
        })
    }

    /// The listen URL of each daemon slot, ephemeral ports resolved.
    pub fn daemon_urls(&self) -> &[TransportUrl] {
        &self.daemon_urls
    }

    /// Enqueue a task. Never suspends; the handle resolves asynchronously.
    pub fn submit(&self, task: Task, handle: Handle) {
        let _ = self.cmd_tx.send(Command::Submit { task, handle });
    }

    /// Remove a queued task or send a cancel frame after its in-flight
    /// daemon. The caller resolves the handle; this is fire-and-forget.
    pub fn cancel(&self, task_id: TaskId) {
        let _ = self.cmd_tx.send(Command::Cancel { task_id });
    }

    /// Replace the sticky-setup payload and push it to every connected
    /// daemon (idle ones immediately, busy ones after completion).
    pub fn everywhere(&self, payload: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Everywhere { payload });
    }

    /// Regenerate slot `i`'s listen URL, returning the fresh address.
    pub async fn saisei(&self, slot: usize) -> Result<TransportUrl, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Saisei { slot, reply })
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)?
    }

    /// Snapshot the roster.
    pub async fn status(&self) -> Result<DispatcherStatus, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { reply })
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    /// Flush the queue as `Canceled`, shut every daemon down, and stop the
    /// event loop.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Derive the listen URL for one daemon slot.
fn slot_url(base: &TransportUrl, i: usize) -> Result<TransportUrl, DispatchError> {
    match base {
        TransportUrl::Tcp { port: 0, .. } | TransportUrl::Ws { port: 0, .. } => Ok(base.clone()),
        TransportUrl::Tcp { port, .. } | TransportUrl::Ws { port, .. } => {
            let slot_port = port
                .checked_add(i as u16)
                .ok_or(DispatchError::PortOverflow(*port))?;
            Ok(base.with_port(slot_port))
        }
        TransportUrl::Ipc { path } => Ok(TransportUrl::Ipc {
            path: format!("{path}.{i}"),
        }),
        TransportUrl::Abstract { name } => Ok(TransportUrl::Abstract {
            name: format!("{name}.{i}"),
        }),
    }
}

/// Per-slot record. Counter semantics: `assigned` bumps at dispatch,
/// `complete` at result arrival, so `assigned - complete` is the in-flight
/// count (0 or 1) except after a mid-task transport loss, where the gap
/// records the lost task.
struct Slot {
    url: TransportUrl,
    generation: u64,
    online: bool,
    instance: i64,
    assigned: u64,
    complete: u64,
    inflight: Option<(TaskId, Handle)>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    /// Setup sent, ack not yet seen; the slot is not dispatchable.
    awaiting_ack: bool,
    /// Sticky payload changed while the slot was busy.
    pending_setup: bool,
    pump: JoinHandle<()>,
}

impl Slot {
    fn new(url: TransportUrl, pump: JoinHandle<()>) -> Self {
        Self {
            url,
            generation: 0,
            online: false,
            instance: 0,
            assigned: 0,
            complete: 0,
            inflight: None,
            outbound: None,
            awaiting_ack: false,
            pending_setup: false,
            pump,
        }
    }

    fn dispatchable(&self) -> bool {
        self.online && self.outbound.is_some() && !self.awaiting_ack && self.inflight.is_none()
    }
}

struct EventLoop {
    slots: Vec<Slot>,
    queue: VecDeque<(Task, Handle)>,
    sticky: Vec<u8>,
    tls: Option<TlsMaterial>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut event_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => {
                            // Host dropped the dispatcher handle.
                            self.shutdown().await;
                            return;
                        }
                        Some(Command::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                Some(event) = event_rx.recv() => self.handle_event(event),
            }
            self.dispatch_pending();
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { task, handle } => {
                debug!("queued task {}", task.task_id);
                self.queue.push_back((task, handle));
            }
            Command::Cancel { task_id } => self.cancel(task_id),
            Command::Everywhere { payload } => self.set_sticky(payload),
            Command::Saisei { slot, reply } => {
                let result = self.saisei(slot).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { .. } => unreachable!("handled in run()"),
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected {
                slot,
                generation,
                outbound,
            } => {
                let sticky = self.sticky.clone();
                let Some(record) = self.slot_current(slot, generation) else {
                    return;
                };
                record.online = true;
                record.instance = record.instance.abs() + 1;
                // Handshake: replay the sticky payload before the slot
                // joins the idle set.
                let setup = Frame::bare(FrameKind::Setup, sticky);
                if outbound.send(setup).is_ok() {
                    record.outbound = Some(outbound);
                    record.awaiting_ack = true;
                    record.pending_setup = false;
                    debug!("daemon {} connected (instance {})", slot, record.instance);
                }
            }
            Event::Inbound {
                slot,
                generation,
                frame,
            } => {
                let sticky = self.sticky.clone();
                let Some(record) = self.slot_current(slot, generation) else {
                    return;
                };
                match record.inflight.take() {
                    Some((task_id, handle)) => match TaskResult::from_result_frame(frame) {
                        Some(result) => {
                            record.complete += 1;
                            // First writer wins: a handle already resolved
                            // by timeout or cancel drops this result.
                            if !handle.resolve(result) {
                                debug!("late result for {} dropped", task_id);
                            }
                            if record.pending_setup {
                                record.pending_setup = false;
                                if let Some(out) = &record.outbound {
                                    if out.send(Frame::bare(FrameKind::Setup, sticky)).is_ok() {
                                        record.awaiting_ack = true;
                                    }
                                }
                            }
                        }
                        None => {
                            // Not a result; keep the in-flight marker.
                            record.inflight = Some((task_id, handle));
                            debug!("non-result frame from busy daemon {}", slot);
                        }
                    },
                    None if record.awaiting_ack => {
                        match frame.kind {
                            FrameKind::ResultOk => {}
                            FrameKind::ResultErr => {
                                warn!("daemon {} failed to apply sticky setup", slot)
                            }
                            other => debug!("unexpected ack frame {:?}", other),
                        }
                        record.awaiting_ack = false;
                    }
                    None => debug!("unsolicited frame from idle daemon {}", slot),
                }
            }
            Event::Disconnected { slot, generation } => {
                let Some(record) = self.slot_current(slot, generation) else {
                    return;
                };
                record.online = false;
                record.outbound = None;
                record.awaiting_ack = false;
                if let Some((task_id, handle)) = record.inflight.take() {
                    // Never silent loss: the in-flight task is published as
                    // TransportLost and deliberately not requeued.
                    warn!("daemon {} lost with task {} in flight", slot, task_id);
                    handle.resolve(TaskResult::TransportLost);
                } else {
                    debug!("daemon {} disconnected while idle", slot);
                }
            }
        }
    }

    fn slot_current(&mut self, slot: usize, generation: u64) -> Option<&mut Slot> {
        let record = self.slots.get_mut(slot)?;
        (record.generation == generation).then_some(record)
    }

    /// Dispatch while the condition holds: queue nonempty and some daemon
    /// idle. Least-loaded first, ties to the lowest index; FIFO over the
    /// queue.
    fn dispatch_pending(&mut self) {
        loop {
            // Drop queued tasks whose handle already resolved (canceled or
            // timed out before assignment).
            while matches!(self.queue.front(), Some((_, h)) if h.poll().is_some()) {
                self.queue.pop_front();
            }
            if self.queue.is_empty() {
                return;
            }

            let Some(slot) = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.dispatchable())
                .min_by_key(|(i, s)| (s.assigned, *i))
                .map(|(i, _)| i)
            else {
                return;
            };

            let (task, handle) = self.queue.pop_front().expect("queue nonempty");
            let record = &mut self.slots[slot];
            let outbound = record.outbound.as_ref().expect("dispatchable slot");
            if outbound.send(task.to_frame()).is_err() {
                // Connection raced away; a Disconnected event is en route.
                record.outbound = None;
                record.online = false;
                self.queue.push_front((task, handle));
                continue;
            }
            debug!("task {} -> daemon {}", task.task_id, slot);
            record.inflight = Some((task.task_id, handle));
            record.assigned += 1;
        }
    }

    fn cancel(&mut self, task_id: TaskId) {
        if let Some(pos) = self.queue.iter().position(|(t, _)| t.task_id == task_id) {
            let (_, handle) = self.queue.remove(pos).expect("position valid");
            handle.resolve(TaskResult::Canceled);
            debug!("canceled queued task {}", task_id);
            return;
        }
        for (i, record) in self.slots.iter().enumerate() {
            if let Some((inflight_id, handle)) = &record.inflight {
                if *inflight_id == task_id {
                    if let Some(out) = &record.outbound {
                        let _ = out.send(cancel_frame(task_id));
                    }
                    // The handle resolves now; the daemon may run to
                    // completion regardless, and its result only advances
                    // the counters.
                    handle.resolve(TaskResult::Canceled);
                    debug!("cancel frame sent to daemon {} for {}", i, task_id);
                    return;
                }
            }
        }
        debug!("cancel for unknown task {} ignored", task_id);
    }

    fn set_sticky(&mut self, payload: Vec<u8>) {
        self.sticky = payload;
        for record in &mut self.slots {
            if record.outbound.is_none() {
                continue; // replayed on next connect
            }
            if record.inflight.is_some() || record.awaiting_ack {
                record.pending_setup = true;
            } else if let Some(out) = &record.outbound {
                if out
                    .send(Frame::bare(FrameKind::Setup, self.sticky.clone()))
                    .is_ok()
                {
                    record.awaiting_ack = true;
                }
            }
        }
    }

    async fn saisei(&mut self, slot: usize) -> Result<TransportUrl, DispatchError> {
        let tls = self.tls.clone();
        let event_tx = self.event_tx.clone();
        let record = self
            .slots
            .get_mut(slot)
            .ok_or(DispatchError::NoSuchSlot(slot))?;

        let fresh = record.url.regenerated();
        let listener = Listener::bind(&fresh, tls.as_ref()).await?;
        let local = listener.local_url().clone();

        // Invalidate whatever was connected or dialing the old URL.
        record.pump.abort();
        record.generation += 1;
        record.pump = tokio::spawn(slot_task(slot, record.generation, listener, event_tx));
        record.url = local.clone();
        record.online = false;
        record.outbound = None;
        record.awaiting_ack = false;
        record.instance = -record.instance.abs();
        if let Some((task_id, handle)) = record.inflight.take() {
            warn!("slot {} regenerated with task {} in flight", slot, task_id);
            handle.resolve(TaskResult::TransportLost);
        }
        info!("slot {} regenerated to {}", slot, local);
        Ok(local)
    }

    fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            connections: self.slots.iter().filter(|s| s.online).count(),
            daemons: self
                .slots
                .iter()
                .enumerate()
                .map(|(i, s)| DaemonRow {
                    i,
                    url: s.url.to_string(),
                    online: s.online as u8,
                    instance: s.instance,
                    assigned: s.assigned,
                    complete: s.complete,
                })
                .collect(),
        }
    }

    async fn shutdown(&mut self) {
        info!(
            "dispatcher shutting down, flushing {} queued tasks",
            self.queue.len()
        );
        for (_, handle) in self.queue.drain(..) {
            handle.resolve(TaskResult::Canceled);
        }
        for record in &mut self.slots {
            if let Some((_, handle)) = record.inflight.take() {
                handle.resolve(TaskResult::Canceled);
            }
            // Dropping the sender after the shutdown frame lets the pump
            // flush the frame and close; daemons that miss it still
            // observe transport loss, which triggers autoexit.
            if let Some(out) = record.outbound.take() {
                let _ = out.send(Frame::bare(FrameKind::Shutdown, Vec::new()));
            }
            record.online = false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        for record in &mut self.slots {
            record.pump.abort();
        }
    }
}

/// Accept loop for one slot: serial connections, one pump at a time. The
/// generation tag lets the event loop discard events from a superseded
/// listener after regeneration.
async fn slot_task(
    slot: usize,
    generation: u64,
    listener: Listener,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    loop {
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("accept on slot {} failed: {}", slot, e);
                continue;
            }
        };
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        if event_tx
            .send(Event::Connected {
                slot,
                generation,
                outbound: out_tx,
            })
            .is_err()
        {
            return; // event loop gone
        }
        pump(conn, out_rx, slot, generation, &event_tx).await;
        if event_tx
            .send(Event::Disconnected { slot, generation })
            .is_err()
        {
            return;
        }
        // A restarted daemon re-dials the same slot URL; accept again.
    }
}

/// Pump frames between one connection and the event loop until either side
/// goes away.
async fn pump(
    mut conn: crate::transport::Connection,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    slot: usize,
    generation: u64,
    event_tx: &mpsc::UnboundedSender<Event>,
) {
    loop {
        tokio::select! {
            inbound = conn.recv() => {
                match inbound {
                    Ok(frame) => {
                        if event_tx
                            .send(Event::Inbound { slot, generation, frame })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(_) => return, // peer gone; caller reports it
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        let is_shutdown = frame.kind == FrameKind::Shutdown;
                        if conn.send(&frame).await.is_err() {
                            return;
                        }
                        if is_shutdown {
                            conn.close().await;
                            return;
                        }
                    }
                    None => {
                        // Dispatcher dropped the writer: deliberate close.
                        conn.close().await;
                        return;
                    }
                }
            }
        }
    }
}
