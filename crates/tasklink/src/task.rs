//! Task model: properties, identity, lifecycle state.
//!
//! Lifecycle: `Queued -> Submitted -> Completed`, or `Queued -> Cancelled`,
//! or `Submitted -> Cancelled`. A task never re-enters `Queued` once it has a
//! transport-issued id, and the id never changes once assigned.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{BinaryCodec, CodecError, JsonCodec, NoHooks, TaskCodec, TaskHooks};
use crate::completion::{Completer, TaskError};
use crate::payload::{CodecTask, ErasedTask};
use crate::transport::{CompletionDisposition, ErrType};

/// Identifier issued by the transport on submission.
///
/// Unique among active tasks; the transport may reuse it after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u32);

impl TaskId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-local identity of a task, assigned at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(uuid::Uuid);

impl TaskKey {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for TaskKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Properties read by the dispatcher and handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProperties {
    /// Destination host; `None` lets the transport pick its default.
    pub host: Option<String>,
    /// Destination path, also the key into the global command id table.
    pub path: String,
    pub cmd_id: u32,
    /// Eligible for a short-lived (per-request) channel.
    pub short_channel: bool,
    /// Eligible for the long-lived channel.
    pub long_channel: bool,
    /// No response is expected.
    pub send_only: bool,
    /// Must wait for the transport's session to be authenticated.
    pub need_authed: bool,
    pub priority: TaskPriority,
    /// Transport-side retries; `None` uses the transport default.
    pub retry_count: Option<u32>,
    /// Transport-side deadline; `None` uses the transport default.
    pub total_timeout: Option<Duration>,
}

impl TaskProperties {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: normalize_host(host.into()),
            path: path.into(),
            cmd_id: 0,
            short_channel: true,
            long_channel: false,
            send_only: false,
            need_authed: false,
            priority: TaskPriority::Normal,
            retry_count: None,
            total_timeout: None,
        }
    }

    pub fn with_cmd_id(mut self, cmd_id: u32) -> Self {
        self.cmd_id = cmd_id;
        self
    }

    pub fn with_short_channel(mut self, support: bool) -> Self {
        self.short_channel = support;
        self
    }

    pub fn with_long_channel(mut self, support: bool) -> Self {
        self.long_channel = support;
        self
    }

    pub fn with_send_only(mut self, send_only: bool) -> Self {
        self.send_only = send_only;
        self
    }

    pub fn with_need_authed(mut self, need_authed: bool) -> Self {
        self.need_authed = need_authed;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }
}

fn normalize_host(host: String) -> Option<String> {
    if host.is_empty() { None } else { Some(host) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Submitted,
    Completed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A request bound to its codec and hooks, ready to be submitted.
pub struct Task<C: TaskCodec, H = NoHooks> {
    properties: TaskProperties,
    codec: C,
    request: C::Request,
    hooks: H,
}

impl<C: TaskCodec> Task<C, NoHooks> {
    pub fn new(properties: TaskProperties, codec: C, request: C::Request) -> Self {
        Self {
            properties,
            codec,
            request,
            hooks: NoHooks,
        }
    }
}

impl Task<JsonCodec, NoHooks> {
    /// JSON task over `serde_json::Value` trees.
    pub fn json(properties: TaskProperties, request: serde_json::Value) -> Self {
        Self::new(properties, JsonCodec::new(), request)
    }
}

impl<Req, Resp> Task<BinaryCodec<Req, Resp>, NoHooks>
where
    BinaryCodec<Req, Resp>: TaskCodec<Request = Req, Response = Resp>,
{
    pub fn binary(properties: TaskProperties, request: Req) -> Self {
        Self::new(properties, BinaryCodec::new(), request)
    }
}

impl<C, H> Task<C, H>
where
    C: TaskCodec,
    H: TaskHooks<C::Request, C::Response>,
{
    pub fn with_hooks<H2>(self, hooks: H2) -> Task<C, H2>
    where
        H2: TaskHooks<C::Request, C::Response>,
    {
        Task {
            properties: self.properties,
            codec: self.codec,
            request: self.request,
            hooks,
        }
    }

    pub fn properties(&self) -> &TaskProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut TaskProperties {
        &mut self.properties
    }

    pub fn request(&self) -> &C::Request {
        &self.request
    }

    pub(crate) fn into_parts(
        self,
        completer: Completer<C::Response>,
    ) -> (TaskProperties, Box<dyn ErasedTask>) {
        let payload = CodecTask::new(self.codec, self.request, self.hooks, completer);
        (self.properties, Box::new(payload))
    }
}

/// Recover a poisoned mutex instead of panicking; the task it guards is
/// still driven to a terminal state by its owner.
pub(crate) fn lock_or_recover<'a, T>(
    mutex: &'a StdMutex<T>,
    what: &'static str,
) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(target: "tasklink::dispatcher", what, "Task mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// Internal phase. `Submitting` is reported as `Queued`: the worker has
/// taken the task but the transport has not issued an id yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Submitting,
    Submitted,
    Completed,
    Cancelled,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

struct Slot {
    phase: Phase,
    task_id: Option<TaskId>,
    cancel_requested: bool,
}

/// What `cancel` has to do, decided atomically against the task's phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelAction {
    /// Was queued; now cancelled. Resolve locally, never touch the transport.
    Local,
    /// In flight with this id; forward to the transport.
    Remote(TaskId),
    /// Being submitted; the worker will cancel once the id is known.
    Deferred,
    /// Terminal, or a cancel is already underway.
    Noop,
}

struct TaskEntry {
    key: TaskKey,
    properties: StdMutex<TaskProperties>,
    slot: StdMutex<Slot>,
    payload: StdMutex<Option<Box<dyn ErasedTask>>>,
}

/// Shared handle to a submitted task.
///
/// Callers use it to observe state and to cancel; everything else is
/// driven by the dispatcher.
#[derive(Clone)]
pub struct TaskRef {
    entry: Arc<TaskEntry>,
}

impl TaskRef {
    pub(crate) fn new(properties: TaskProperties, payload: Box<dyn ErasedTask>) -> Self {
        Self {
            entry: Arc::new(TaskEntry {
                key: TaskKey::new(),
                properties: StdMutex::new(properties),
                slot: StdMutex::new(Slot {
                    phase: Phase::Queued,
                    task_id: None,
                    cancel_requested: false,
                }),
                payload: StdMutex::new(Some(payload)),
            }),
        }
    }

    pub fn key(&self) -> TaskKey {
        self.entry.key
    }

    pub fn state(&self) -> TaskState {
        match self.slot().phase {
            Phase::Queued | Phase::Submitting => TaskState::Queued,
            Phase::Submitted => TaskState::Submitted,
            Phase::Completed => TaskState::Completed,
            Phase::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.slot().phase.is_terminal()
    }

    /// Transport-issued id; `None` until submitted.
    pub fn task_id(&self) -> Option<TaskId> {
        self.slot().task_id
    }

    pub fn properties(&self) -> TaskProperties {
        lock_or_recover(&self.entry.properties, "properties").clone()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        lock_or_recover(&self.entry.slot, "slot")
    }

    fn take_payload(&self) -> Option<Box<dyn ErasedTask>> {
        lock_or_recover(&self.entry.payload, "payload").take()
    }

    pub(crate) fn set_cmd_id(&self, cmd_id: u32) {
        lock_or_recover(&self.entry.properties, "properties").cmd_id = cmd_id;
    }

    /// `Queued -> Submitting`. False if the task is no longer queued.
    pub(crate) fn begin_submit(&self) -> bool {
        let mut slot = self.slot();
        if slot.phase != Phase::Queued {
            return false;
        }
        slot.phase = Phase::Submitting;
        true
    }

    /// Runs `before_encode` and the codec. `None` once the payload is gone.
    pub(crate) fn encode(&self) -> Option<Result<Bytes, CodecError>> {
        let mut payload = lock_or_recover(&self.entry.payload, "payload");
        payload.as_mut().map(|p| p.encode())
    }

    /// `Submitting -> Submitted`, recording the id. Returns whether a cancel
    /// arrived while the transport call was in progress.
    pub(crate) fn mark_submitted(&self, task_id: TaskId) -> bool {
        let mut slot = self.slot();
        if slot.phase == Phase::Submitting {
            slot.phase = Phase::Submitted;
        }
        if slot.task_id.is_none() {
            slot.task_id = Some(task_id);
        }
        slot.cancel_requested
    }

    /// `Submitting -> Queued` after the transport turned out to be
    /// unavailable. False if a cancel arrived meanwhile; the phase is then
    /// left for `abort` to settle.
    pub(crate) fn revert_to_queued(&self) -> bool {
        let mut slot = self.slot();
        if slot.cancel_requested || slot.phase != Phase::Submitting {
            return false;
        }
        slot.phase = Phase::Queued;
        true
    }

    pub(crate) fn request_cancel(&self) -> CancelAction {
        let mut slot = self.slot();
        match slot.phase {
            Phase::Queued => {
                slot.phase = Phase::Cancelled;
                CancelAction::Local
            }
            Phase::Submitting => {
                slot.cancel_requested = true;
                CancelAction::Deferred
            }
            Phase::Submitted if slot.cancel_requested => CancelAction::Noop,
            Phase::Submitted => {
                slot.cancel_requested = true;
                match slot.task_id {
                    Some(id) => CancelAction::Remote(id),
                    None => CancelAction::Noop,
                }
            }
            Phase::Completed | Phase::Cancelled => CancelAction::Noop,
        }
    }

    /// Deliver `error` as the task's terminal outcome. Returns false if the
    /// outcome was already delivered.
    pub(crate) fn abort(&self, error: TaskError) -> bool {
        {
            let mut slot = self.slot();
            match slot.phase {
                // `request_cancel` already moved a queued task to Cancelled
                // but left the payload for the caller to resolve.
                Phase::Cancelled if matches!(error, TaskError::Cancelled) => {}
                phase if phase.is_terminal() => return false,
                _ => {
                    slot.phase = if matches!(error, TaskError::Cancelled) {
                        Phase::Cancelled
                    } else {
                        Phase::Completed
                    };
                }
            }
        }
        match self.take_payload() {
            Some(payload) => {
                payload.fail(error);
                true
            }
            None => false,
        }
    }

    /// Route the transport's completion to the codec and the waiting caller.
    pub(crate) fn complete(
        &self,
        err_type: ErrType,
        err_code: i32,
        body: &[u8],
    ) -> CompletionDisposition {
        {
            let mut slot = self.slot();
            if slot.phase != Phase::Submitted {
                return CompletionDisposition::UnknownTask;
            }
            slot.phase = Phase::Completed;
        }
        match self.take_payload() {
            Some(payload) => payload.finish(err_type, err_code, body),
            None => CompletionDisposition::UnknownTask,
        }
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key
    }
}

impl Eq for TaskRef {}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot();
        f.debug_struct("TaskRef")
            .field("key", &self.entry.key)
            .field("phase", &slot.phase)
            .field("task_id", &slot.task_id)
            .finish()
    }
}
