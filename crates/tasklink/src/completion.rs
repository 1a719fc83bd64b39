//! Task outcomes and the caller-side handle used to await them.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::codec::CodecError;
use crate::dispatcher::Dispatcher;
use crate::task::{TaskKey, TaskRef};
use crate::transport::{ErrType, LOCAL_CANCEL_CODE};

pub type TaskResult<R> = Result<R, TaskError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("task failed: errType={err_type}, errCode={err_code}")]
    Failed { err_type: ErrType, err_code: i32 },
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
    #[error("task cancelled")]
    Cancelled,
    #[error("transport rejected task: {0}")]
    Rejected(String),
}

impl TaskError {
    /// `(errType, errCode)` pair as reported to task owners, where one exists.
    pub fn codes(&self) -> Option<(ErrType, i32)> {
        match self {
            Self::Failed { err_type, err_code } => Some((*err_type, *err_code)),
            Self::Cancelled => Some((ErrType::Local, LOCAL_CANCEL_CODE)),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<CodecError> for TaskError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(msg) => Self::Encode(msg),
            CodecError::Decode(msg) => Self::Decode(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task result already delivered")]
pub struct AlreadyResolved;

/// Single-use sender for a task's terminal outcome.
pub struct Completer<R> {
    tx: Option<oneshot::Sender<TaskResult<R>>>,
}

pub(crate) fn channel<R>() -> (Completer<R>, oneshot::Receiver<TaskResult<R>>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx: Some(tx) }, rx)
}

impl<R> Completer<R> {
    /// Deliver the outcome. Nobody waiting is fine (fire-and-forget); a
    /// second delivery is rejected.
    pub fn resolve(&mut self, result: TaskResult<R>) -> Result<(), AlreadyResolved> {
        let Some(tx) = self.tx.take() else {
            tracing::error!(target: "tasklink::dispatcher", "Task outcome delivered twice, ignoring");
            return Err(AlreadyResolved);
        };
        if tx.send(result).is_err() {
            tracing::debug!(target: "tasklink::dispatcher", "Task outcome dropped, nobody waiting");
        }
        Ok(())
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

impl<R> Drop for Completer<R> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::error!(target: "tasklink::dispatcher", "Task dropped without an outcome, reporting cancelled");
            let _ = tx.send(Err(TaskError::Cancelled));
        }
    }
}

/// Caller's view of a submitted task.
///
/// Dropping the handle does not cancel the task; use [`TaskHandle::cancel`]
/// or [`TaskHandle::detach`] to say what you mean.
pub struct TaskHandle<R> {
    task: TaskRef,
    rx: oneshot::Receiver<TaskResult<R>>,
    dispatcher: Dispatcher,
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(
        task: TaskRef,
        rx: oneshot::Receiver<TaskResult<R>>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            task,
            rx,
            dispatcher,
        }
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn key(&self) -> TaskKey {
        self.task.key()
    }

    pub fn cancel(&self) {
        self.dispatcher.cancel(&self.task);
    }

    /// Wait for the outcome. On timeout the task is cancelled (once) and
    /// `Timeout` is returned.
    pub async fn wait(self, timeout: Duration) -> TaskResult<R> {
        let Self {
            task,
            rx,
            dispatcher,
        } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::Cancelled),
            Err(_) => {
                tracing::info!(
                    target: "tasklink::dispatcher",
                    task_key = %task.key(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Task timed out, cancelling"
                );
                dispatcher.cancel(&task);
                Err(TaskError::Timeout(timeout))
            }
        }
    }

    /// [`TaskHandle::wait`] with the dispatcher's configured default timeout.
    pub async fn wait_default(self) -> TaskResult<R> {
        let timeout = self.dispatcher.config().default_timeout;
        self.wait(timeout).await
    }

    /// Let the task run to completion with nobody observing the outcome.
    pub fn detach(self) -> TaskRef {
        self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_resolve_is_rejected() {
        let (mut completer, mut rx) = channel::<u32>();
        assert_eq!(completer.resolve(Ok(1)), Ok(()));
        assert!(completer.is_resolved());
        assert_eq!(completer.resolve(Ok(2)), Err(AlreadyResolved));
        assert_eq!(rx.try_recv().unwrap(), Ok(1));
    }

    #[test]
    fn resolve_without_receiver_is_fine() {
        let (mut completer, rx) = channel::<u32>();
        drop(rx);
        assert_eq!(completer.resolve(Err(TaskError::Cancelled)), Ok(()));
    }

    #[test]
    fn dropping_unresolved_completer_reports_cancelled() {
        let (completer, mut rx) = channel::<u32>();
        drop(completer);
        assert_eq!(rx.try_recv().unwrap(), Err(TaskError::Cancelled));
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            TaskError::Cancelled.codes(),
            Some((ErrType::Local, LOCAL_CANCEL_CODE))
        );
        assert_eq!(
            TaskError::Failed {
                err_type: ErrType::Server,
                err_code: 7
            }
            .codes(),
            Some((ErrType::Server, 7))
        );
        assert_eq!(TaskError::Decode("x".into()).codes(), None);
        assert!(TaskError::Timeout(Duration::from_secs(1)).is_timeout());
    }

    #[test]
    fn cancel_code_matches_transport_convention() {
        // transports report a client cancel as code -1; the type stays Local
        assert_eq!(LOCAL_CANCEL_CODE, -1);
        let (err_type, err_code) = TaskError::Cancelled.codes().unwrap();
        assert_eq!(err_type, ErrType::Local);
        assert_eq!(err_code, LOCAL_CANCEL_CODE);
    }

    #[test]
    fn codec_errors_convert() {
        assert_eq!(
            TaskError::from(CodecError::Decode("bad".into())),
            TaskError::Decode("bad".into())
        );
        insta::assert_snapshot!(
            TaskError::Failed { err_type: ErrType::Server, err_code: 7 },
            @"task failed: errType=server(8), errCode=7"
        );
    }
}
