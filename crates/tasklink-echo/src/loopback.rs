//! In-process transport that echoes every request body back as its response.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tasklink::{
    CompletionDisposition, ErrType, TaskId, TaskProperties, Transport, TransportError,
    TransportEvents,
};

/// Path that makes the loopback report a server-side failure.
pub const FAIL_PATH: &str = "/echo/fail";

/// Error code reported for [`FAIL_PATH`].
pub const FAIL_CODE: i32 = 500;

pub struct LoopbackTransport {
    latency: Duration,
    ready: AtomicBool,
    next_id: AtomicU32,
    events: StdMutex<Option<TransportEvents>>,
    cancelled: Arc<StdMutex<HashSet<TaskId>>>,
}

impl LoopbackTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ready: AtomicBool::new(false),
            next_id: AtomicU32::new(0),
            events: StdMutex::new(None),
            cancelled: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    fn events(&self) -> Option<TransportEvents> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Emit a server push. False if not bound yet or nobody handles `cmd_id`.
    pub fn push(&self, cmd_id: u32, payload: Bytes) -> bool {
        match self.events() {
            Some(events) => events.on_push_message(cmd_id, payload),
            None => false,
        }
    }

    /// Drop the link; the dispatcher rebinds on its next submission.
    pub fn disconnect(&self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Some(events) = self.events() {
            events.on_disconnected();
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn describe(&self) -> Option<String> {
        Some(format!("loopback/{}", env!("CARGO_PKG_VERSION")))
    }

    async fn bind(&self, events: TransportEvents) -> Result<(), TransportError> {
        tracing::info!("Loopback bound");
        match self.events.lock() {
            Ok(mut guard) => *guard = Some(events.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(events.clone()),
        }
        self.ready.store(true, Ordering::SeqCst);
        events.on_connected();
        Ok(())
    }

    async fn send(
        &self,
        payload: Bytes,
        properties: &TaskProperties,
    ) -> Result<TaskId, TransportError> {
        if !self.is_ready() {
            return Err(TransportError::Unavailable);
        }
        let events = self.events().ok_or(TransportError::Unavailable)?;
        let task_id = TaskId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);

        if properties.send_only {
            tracing::debug!(%task_id, "Send-only task, no response");
        }

        let (err_type, err_code) = if properties.path == FAIL_PATH {
            (ErrType::Server, FAIL_CODE)
        } else {
            (ErrType::Ok, 0)
        };

        // Completion must come from outside `send`.
        let latency = self.latency;
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if take_cancelled(&cancelled, task_id) {
                tracing::debug!(%task_id, "Echo dropped, task was cancelled");
                return;
            }
            let disposition = events
                .on_task_complete(task_id, err_type, err_code, payload)
                .disposition()
                .await;
            if disposition != CompletionDisposition::Handled {
                tracing::debug!(%task_id, ?disposition, "Echo not handled");
            }
        });

        Ok(task_id)
    }

    async fn cancel(&self, task_id: TaskId) -> Result<(), TransportError> {
        if task_id.get() == 0 || task_id.get() > self.next_id.load(Ordering::SeqCst) {
            return Err(TransportError::Other(format!("task {task_id} unknown")));
        }
        match self.cancelled.lock() {
            Ok(mut guard) => guard.insert(task_id),
            Err(poisoned) => poisoned.into_inner().insert(task_id),
        };
        tracing::debug!(%task_id, "Loopback cancel");
        Ok(())
    }
}

fn take_cancelled(cancelled: &StdMutex<HashSet<TaskId>>, task_id: TaskId) -> bool {
    match cancelled.lock() {
        Ok(mut guard) => guard.remove(&task_id),
        Err(poisoned) => poisoned.into_inner().remove(&task_id),
    }
}
