//! Dispatcher - owns the task queue and the single worker that talks to the
//! transport.
//!
//! Flow:
//! 1. `submit` appends to an unbounded FIFO and returns a handle immediately
//! 2. The worker takes the head; while the transport is not ready the head
//!    stays put and a bind is triggered (rate-limited)
//! 3. Ready: apply the global command id table, encode, `send`, record the
//!    transport-issued id in the in-flight table
//! 4. Completions, cancels and link changes arrive as commands on the same
//!    worker, so in-flight bookkeeping needs no locking
//! 5. Shutdown: everything still queued or in flight ends as `Cancelled`

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cmd_table::CmdIdTable;
use crate::codec::{TaskCodec, TaskHooks};
use crate::completion::{self, TaskError, TaskHandle};
use crate::config::DispatcherConfig;
use crate::push::PushRouter;
use crate::task::{CancelAction, Task, TaskId, TaskRef, lock_or_recover};
use crate::transport::{CompletionDisposition, ErrType, Transport, TransportError, TransportEvents};
use crate::version::VersionInfo;

/// Messages from callers and the transport to the worker.
pub(crate) enum Command {
    Cancel(TaskRef),
    Complete {
        task_id: TaskId,
        err_type: ErrType,
        err_code: i32,
        body: Bytes,
        reply: oneshot::Sender<CompletionDisposition>,
    },
    Link(bool),
    Foreground(bool),
}

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherSnapshot {
    pub queued: usize,
    pub in_flight: usize,
    pub linked: bool,
    pub shut_down: bool,
    pub version: VersionInfo,
}

/// Saturating decrement; `drain` may have zeroed the gauge already.
fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        Some(n.saturating_sub(1))
    });
}

/// State visible to both the worker and the handles.
struct Shared {
    config: DispatcherConfig,
    cmd_ids: Arc<CmdIdTable>,
    push: Arc<PushRouter>,
    shutdown: CancellationToken,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    linked: AtomicBool,
    version: VersionInfo,
}

struct Inner {
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<TaskRef>,
    command_tx: mpsc::UnboundedSender<Command>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a running dispatcher.
///
/// The worker stops on [`Dispatcher::shutdown`], or once every handle
/// (including outstanding [`TaskHandle`]s) is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>, config: DispatcherConfig) -> Self {
        Self::spawn_with_tables(
            transport,
            config,
            Arc::new(CmdIdTable::new()),
            Arc::new(PushRouter::new()),
        )
    }

    /// Like [`Dispatcher::spawn`], sharing an existing command id table and
    /// push router.
    pub fn spawn_with_tables(
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
        cmd_ids: Arc<CmdIdTable>,
        push: Arc<PushRouter>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut version = VersionInfo::new();
        if let Some(name) = transport.describe() {
            version = version.with_transport(name);
        }

        let shared = Arc::new(Shared {
            config,
            cmd_ids,
            push,
            shutdown: CancellationToken::new(),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            linked: AtomicBool::new(false),
            version,
        });

        tracing::info!(
            target: "tasklink::dispatcher",
            ready_poll_ms = shared.config.ready_poll_interval.as_millis() as u64,
            rebind_ms = shared.config.rebind_interval.as_millis() as u64,
            "Starting dispatcher"
        );

        let worker = Worker {
            events: TransportEvents::new(command_tx.clone(), Arc::clone(&shared.push)),
            shared: Arc::clone(&shared),
            transport,
            queue_rx,
            command_rx,
            linked: false,
            last_bind: None,
            pending: None,
            in_flight: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            inner: Arc::new(Inner {
                shared,
                queue_tx,
                command_tx,
                worker: StdMutex::new(Some(handle)),
            }),
        }
    }

    /// Enqueue a task. Never blocks; the handle observes the outcome.
    pub fn submit<C, H>(&self, task: Task<C, H>) -> TaskHandle<C::Response>
    where
        C: TaskCodec,
        H: TaskHooks<C::Request, C::Response>,
    {
        let (completer, rx) = completion::channel();
        let (properties, payload) = task.into_parts(completer);
        let task = TaskRef::new(properties, payload);

        tracing::debug!(
            target: "tasklink::dispatcher",
            task_key = %task.key(),
            "Task queued"
        );

        let shared = &self.inner.shared;
        shared.queued.fetch_add(1, Ordering::SeqCst);
        if shared.shutdown.is_cancelled() || self.inner.queue_tx.send(task.clone()).is_err() {
            tracing::warn!(target: "tasklink::dispatcher", task_key = %task.key(), "Dispatcher is shut down, cancelling task");
            decrement(&shared.queued);
            task.abort(TaskError::Cancelled);
        }

        TaskHandle::new(task, rx, self.clone())
    }

    /// Cancel a task. Queued tasks never reach the transport; submitted
    /// tasks are cancelled on the transport and end as `Cancelled` whatever
    /// it answers. Terminal tasks are left alone.
    pub fn cancel(&self, task: &TaskRef) {
        match task.request_cancel() {
            CancelAction::Local => {
                decrement(&self.inner.shared.queued);
                tracing::info!(target: "tasklink::dispatcher", task_key = %task.key(), "Cancelled queued task");
                task.abort(TaskError::Cancelled);
            }
            CancelAction::Remote(task_id) => {
                tracing::debug!(target: "tasklink::dispatcher", %task_id, "Forwarding cancel to worker");
                if self
                    .inner
                    .command_tx
                    .send(Command::Cancel(task.clone()))
                    .is_err()
                {
                    task.abort(TaskError::Cancelled);
                }
            }
            CancelAction::Deferred => {
                tracing::debug!(target: "tasklink::dispatcher", task_key = %task.key(), "Cancel requested during submission");
            }
            CancelAction::Noop => {}
        }
    }

    /// Forward a foreground/background hint to the transport, binding it
    /// first if it is not linked.
    pub fn set_foreground(&self, foreground: bool) {
        let _ = self.inner.command_tx.send(Command::Foreground(foreground));
    }

    /// Callbacks for transports wired up outside of `bind`.
    pub fn events(&self) -> TransportEvents {
        TransportEvents::new(
            self.inner.command_tx.clone(),
            Arc::clone(&self.inner.shared.push),
        )
    }

    pub fn cmd_ids(&self) -> &Arc<CmdIdTable> {
        &self.inner.shared.cmd_ids
    }

    pub fn push_router(&self) -> &Arc<PushRouter> {
        &self.inner.shared.push
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.shared.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shared.shutdown.is_cancelled()
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let shared = &self.inner.shared;
        DispatcherSnapshot {
            queued: shared.queued.load(Ordering::SeqCst),
            in_flight: shared.in_flight.load(Ordering::SeqCst),
            linked: shared.linked.load(Ordering::SeqCst),
            shut_down: shared.shutdown.is_cancelled(),
            version: shared.version.clone(),
        }
    }

    /// Stop the worker and wait for it. Queued and in-flight tasks end as
    /// `Cancelled`; later submissions are cancelled immediately.
    pub async fn shutdown(&self) {
        self.inner.shared.shutdown.cancel();
        let handle = lock_or_recover(&self.inner.worker, "worker").take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(target: "tasklink::dispatcher", error = %e, "Dispatcher worker panicked");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

struct Worker {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    events: TransportEvents,
    queue_rx: mpsc::UnboundedReceiver<TaskRef>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    linked: bool,
    last_bind: Option<Instant>,
    /// Head of the queue, held while the transport is not ready.
    pending: Option<TaskRef>,
    in_flight: HashMap<TaskId, TaskRef>,
}

impl Worker {
    async fn run(mut self) {
        let poll = self.shared.config.ready_poll_interval;
        loop {
            if let Some(task) = self.pending.take() {
                self.pending = self.try_submit(task).await;
            }

            tokio::select! {
                biased;

                _ = self.shared.shutdown.cancelled() => {
                    tracing::info!(target: "tasklink::dispatcher", "Shutdown requested");
                    break;
                }

                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }

                task = self.queue_rx.recv(), if self.pending.is_none() => {
                    match task {
                        Some(task) => self.pending = Some(task),
                        None => {
                            tracing::debug!(target: "tasklink::dispatcher", "All dispatcher handles dropped");
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep(poll), if self.pending.is_some() => {}
            }
        }
        self.drain();
    }

    fn is_ready(&self) -> bool {
        self.linked && self.transport.is_ready()
    }

    fn set_linked(&mut self, linked: bool) {
        self.linked = linked;
        self.shared.linked.store(linked, Ordering::SeqCst);
    }

    fn sync_in_flight(&self) {
        self.shared
            .in_flight
            .store(self.in_flight.len(), Ordering::SeqCst);
    }

    /// Trigger a bind unless one was triggered within the rebind interval.
    async fn ensure_bound(&mut self) {
        let due = self
            .last_bind
            .is_none_or(|at| at.elapsed() >= self.shared.config.rebind_interval);
        if !due {
            return;
        }
        self.last_bind = Some(Instant::now());
        tracing::info!(target: "tasklink::dispatcher", "Transport not ready, binding");
        if let Err(e) = self.transport.bind(self.events.clone()).await {
            tracing::warn!(target: "tasklink::dispatcher", error = %e, "Transport bind failed");
        }
    }

    /// Submit `task` if the transport is ready. Returns the task back when
    /// it has to stay at the head of the queue.
    async fn try_submit(&mut self, task: TaskRef) -> Option<TaskRef> {
        if task.is_terminal() {
            tracing::debug!(target: "tasklink::dispatcher", task_key = %task.key(), "Skipping task cancelled while queued");
            return None;
        }
        if !self.is_ready() {
            self.ensure_bound().await;
            return Some(task);
        }
        if !task.begin_submit() {
            return None;
        }
        decrement(&self.shared.queued);

        let mut properties = task.properties();
        if let Some(cmd_id) = self.shared.cmd_ids.get(&properties.path) {
            if cmd_id != properties.cmd_id {
                tracing::info!(
                    target: "tasklink::dispatcher",
                    path = %properties.path,
                    from = properties.cmd_id,
                    to = cmd_id,
                    "Overwriting cmd id from global table"
                );
            }
            properties.cmd_id = cmd_id;
            task.set_cmd_id(cmd_id);
        }

        let payload = match task.encode() {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                tracing::warn!(target: "tasklink::codec", task_key = %task.key(), error = %e, "Failed to encode request");
                task.abort(TaskError::from(e));
                return None;
            }
            None => return None,
        };

        tracing::debug!(
            target: "tasklink::dispatcher",
            task_key = %task.key(),
            path = %properties.path,
            cmd_id = properties.cmd_id,
            payload_len = payload.len(),
            "Sending task"
        );

        match self.transport.send(payload, &properties).await {
            Ok(task_id) => {
                self.on_submitted(task, task_id).await;
                None
            }
            Err(TransportError::Unavailable) => {
                tracing::warn!(target: "tasklink::dispatcher", task_key = %task.key(), "Transport unavailable, task stays queued");
                self.set_linked(false);
                if task.revert_to_queued() {
                    self.shared.queued.fetch_add(1, Ordering::SeqCst);
                    Some(task)
                } else {
                    task.abort(TaskError::Cancelled);
                    None
                }
            }
            Err(e) => {
                tracing::error!(target: "tasklink::dispatcher", task_key = %task.key(), error = %e, "Transport rejected task");
                task.abort(TaskError::Rejected(e.to_string()));
                None
            }
        }
    }

    async fn on_submitted(&mut self, task: TaskRef, task_id: TaskId) {
        let cancel_requested = task.mark_submitted(task_id);
        tracing::debug!(target: "tasklink::dispatcher", task_key = %task.key(), %task_id, "Task submitted");

        if let Some(previous) = self.in_flight.insert(task_id, task.clone()) {
            tracing::error!(target: "tasklink::dispatcher", %task_id, "Transport reused an active task id");
            previous.abort(TaskError::Rejected(format!("task id {task_id} reused")));
        }
        self.sync_in_flight();

        if cancel_requested {
            self.cancel_in_flight(task).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Cancel(task) => self.cancel_in_flight(task).await,
            Command::Complete {
                task_id,
                err_type,
                err_code,
                body,
                reply,
            } => {
                let disposition = self.complete(task_id, err_type, err_code, &body);
                let _ = reply.send(disposition);
            }
            Command::Link(true) => {
                tracing::info!(target: "tasklink::dispatcher", "Transport linked");
                self.set_linked(true);
            }
            Command::Link(false) => {
                tracing::warn!(target: "tasklink::dispatcher", "Transport link lost");
                self.set_linked(false);
                self.last_bind = None;
            }
            Command::Foreground(foreground) => {
                if self.linked {
                    if let Err(e) = self.transport.set_foreground(foreground).await {
                        tracing::warn!(target: "tasklink::dispatcher", error = %e, foreground, "Foreground hint failed");
                    }
                } else {
                    self.ensure_bound().await;
                }
            }
        }
    }

    async fn cancel_in_flight(&mut self, task: TaskRef) {
        let Some(task_id) = task.task_id() else {
            return;
        };
        let tracked = self
            .in_flight
            .get(&task_id)
            .is_some_and(|current| current == &task);
        if !tracked {
            tracing::debug!(target: "tasklink::dispatcher", %task_id, "Cancel for task no longer in flight");
            return;
        }
        self.in_flight.remove(&task_id);
        self.sync_in_flight();

        match self.transport.cancel(task_id).await {
            Ok(()) => {
                tracing::info!(target: "tasklink::dispatcher", %task_id, "Cancelled task on transport");
            }
            Err(e) => {
                tracing::warn!(target: "tasklink::dispatcher", %task_id, error = %e, "Transport cancel failed, cancelling locally");
            }
        }
        task.abort(TaskError::Cancelled);
    }

    fn complete(
        &mut self,
        task_id: TaskId,
        err_type: ErrType,
        err_code: i32,
        body: &[u8],
    ) -> CompletionDisposition {
        let Some(task) = self.in_flight.remove(&task_id) else {
            tracing::debug!(target: "tasklink::dispatcher", %task_id, "Completion for unknown task");
            return CompletionDisposition::UnknownTask;
        };
        self.sync_in_flight();

        tracing::debug!(
            target: "tasklink::dispatcher",
            %task_id,
            %err_type,
            err_code,
            body_len = body.len(),
            "Task completed"
        );
        task.complete(err_type, err_code, body)
    }

    fn drain(&mut self) {
        self.queue_rx.close();
        self.command_rx.close();

        let mut cancelled = 0usize;
        if let Some(task) = self.pending.take()
            && task.abort(TaskError::Cancelled)
        {
            cancelled += 1;
        }
        while let Ok(task) = self.queue_rx.try_recv() {
            if task.abort(TaskError::Cancelled) {
                cancelled += 1;
            }
        }
        for (_, task) in self.in_flight.drain() {
            if task.abort(TaskError::Cancelled) {
                cancelled += 1;
            }
        }
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                Command::Complete { reply, .. } => {
                    let _ = reply.send(CompletionDisposition::UnknownTask);
                }
                Command::Cancel(task) => {
                    task.abort(TaskError::Cancelled);
                }
                Command::Link(_) | Command::Foreground(_) => {}
            }
        }

        self.shared.queued.store(0, Ordering::SeqCst);
        self.shared.in_flight.store(0, Ordering::SeqCst);
        self.set_linked(false);
        tracing::info!(target: "tasklink::dispatcher", cancelled, "Dispatcher worker exiting");
    }
}
