//! Contract with the external long-lived transport.
//!
//! The transport owns sockets, retries and channel selection. This crate
//! only hands it encoded payloads and consumes its callbacks:
//!
//! - [`Transport`]: what the dispatcher calls (bind, send, cancel)
//! - [`TransportEvents`]: what the transport calls back (completions,
//!   pushes, link up/down). A clone is handed over on every `bind`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::dispatcher::Command;
use crate::push::PushRouter;
use crate::task::{TaskId, TaskProperties};

/// Error code paired with [`ErrType::Local`] for tasks cancelled on the client.
///
/// Transports report a client-side cancel as `(-1, -1)`; here the error type
/// is [`ErrType::Local`] instead, so the pair stays inside the known
/// categories. Only the code is shared.
pub const LOCAL_CANCEL_CODE: i32 = -1;

/// Category of a task completion, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrType {
    Ok,
    Falsified,
    Dial,
    Dns,
    Socket,
    Http,
    NetMsgXp,
    EnDecode,
    Server,
    Local,
    Canceled,
    Unknown(i32),
}

impl ErrType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Falsified,
            2 => Self::Dial,
            3 => Self::Dns,
            4 => Self::Socket,
            5 => Self::Http,
            6 => Self::NetMsgXp,
            7 => Self::EnDecode,
            8 => Self::Server,
            9 => Self::Local,
            10 => Self::Canceled,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Falsified => 1,
            Self::Dial => 2,
            Self::Dns => 3,
            Self::Socket => 4,
            Self::Http => 5,
            Self::NetMsgXp => 6,
            Self::EnDecode => 7,
            Self::Server => 8,
            Self::Local => 9,
            Self::Canceled => 10,
            Self::Unknown(code) => *code,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Falsified => "falsified",
            Self::Dial => "dial",
            Self::Dns => "dns",
            Self::Socket => "socket",
            Self::Http => "http",
            Self::NetMsgXp => "netmsg",
            Self::EnDecode => "endecode",
            Self::Server => "server",
            Self::Local => "local",
            Self::Canceled => "canceled",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for ErrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.code())
    }
}

/// How a completion was handled, reported back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDisposition {
    /// Delivered to the task, including nonzero error codes.
    Handled,
    /// The response could not be decoded. The task is over; do not retry.
    TaskEnd,
    /// No in-flight task has this id (already cancelled or already completed).
    UnknownTask,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable")]
    Unavailable,
    #[error("transport rejected task: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// The external transport, seen from the dispatcher.
///
/// `send` must not wait on a [`CompletionReceipt`] for the task it is
/// submitting: completions are processed by the same worker that calls `send`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the transport can accept submissions right now.
    fn is_ready(&self) -> bool;

    /// Start connecting. The transport reports success later through
    /// [`TransportEvents::on_connected`].
    async fn bind(&self, events: TransportEvents) -> Result<(), TransportError>;

    /// Submit an encoded task and return the transport-issued id.
    async fn send(&self, payload: Bytes, properties: &TaskProperties)
    -> Result<TaskId, TransportError>;

    /// Best-effort cancel of an in-flight task.
    async fn cancel(&self, task_id: TaskId) -> Result<(), TransportError>;

    /// Name and version reported in dispatcher snapshots.
    fn describe(&self) -> Option<String> {
        None
    }

    /// Foreground/background hint.
    async fn set_foreground(&self, _foreground: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Callbacks the transport uses to talk back to the dispatcher.
#[derive(Clone)]
pub struct TransportEvents {
    command_tx: mpsc::UnboundedSender<Command>,
    push: Arc<PushRouter>,
}

impl TransportEvents {
    pub(crate) fn new(command_tx: mpsc::UnboundedSender<Command>, push: Arc<PushRouter>) -> Self {
        Self { command_tx, push }
    }

    /// Report the end of a task. The returned receipt resolves once the
    /// dispatcher has routed the completion; dropping it is fine.
    pub fn on_task_complete(
        &self,
        task_id: TaskId,
        err_type: ErrType,
        err_code: i32,
        body: Bytes,
    ) -> CompletionReceipt {
        let (reply, rx) = oneshot::channel();
        let command = Command::Complete {
            task_id,
            err_type,
            err_code,
            body,
            reply,
        };
        if self.command_tx.send(command).is_err() {
            tracing::debug!(target: "tasklink::dispatcher", %task_id, "Completion after dispatcher shutdown");
        }
        CompletionReceipt { rx }
    }

    /// Route an unsolicited server message. Returns whether a handler took it.
    pub fn on_push_message(&self, cmd_id: u32, payload: Bytes) -> bool {
        self.push.dispatch(cmd_id, payload)
    }

    pub fn on_connected(&self) {
        let _ = self.command_tx.send(Command::Link(true));
    }

    pub fn on_disconnected(&self) {
        let _ = self.command_tx.send(Command::Link(false));
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("closed", &self.command_tx.is_closed())
            .finish()
    }
}

/// Pending answer to [`TransportEvents::on_task_complete`].
#[must_use = "await the receipt to learn whether the task should be retried"]
pub struct CompletionReceipt {
    rx: oneshot::Receiver<CompletionDisposition>,
}

impl CompletionReceipt {
    /// Resolves to `UnknownTask` if the dispatcher is gone.
    pub async fn disposition(self) -> CompletionDisposition {
        self.rx.await.unwrap_or(CompletionDisposition::UnknownTask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_type_codes_roundtrip() {
        for code in -2..=12 {
            assert_eq!(ErrType::from_code(code).code(), code);
        }
        assert_eq!(ErrType::from_code(9), ErrType::Local);
        assert_eq!(ErrType::from_code(42), ErrType::Unknown(42));
    }

    #[test]
    fn err_type_display() {
        insta::assert_snapshot!(ErrType::Server, @"server(8)");
        insta::assert_snapshot!(ErrType::Unknown(-7), @"unknown(-7)");
    }

    #[tokio::test]
    async fn receipt_reports_unknown_when_dispatcher_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let events = TransportEvents::new(tx, Arc::new(PushRouter::new()));

        let receipt = events.on_task_complete(TaskId::new(1), ErrType::Ok, 0, Bytes::new());
        assert_eq!(
            receipt.disposition().await,
            CompletionDisposition::UnknownTask
        );
    }

    #[test]
    fn push_goes_straight_to_router() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = Arc::new(PushRouter::new());
        router.register(7, |_msg: crate::push::PushMessage| {});
        let events = TransportEvents::new(tx, Arc::clone(&router));

        assert!(events.on_push_message(7, Bytes::from_static(b"x")));
        assert!(!events.on_push_message(8, Bytes::from_static(b"x")));
    }
}
