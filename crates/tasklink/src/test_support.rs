//! In-memory transport for dispatcher tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::task::{TaskId, TaskProperties};
use crate::transport::{Transport, TransportError, TransportEvents};

#[derive(Debug, Clone)]
pub(crate) struct SentTask {
    pub task_id: TaskId,
    pub payload: Bytes,
    pub properties: TaskProperties,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    ready: AtomicBool,
    connect_on_bind: AtomicBool,
    fail_cancels: AtomicBool,
    next_id: AtomicU32,
    binds: AtomicUsize,
    send_attempts: AtomicUsize,
    send_delay: Mutex<Option<Duration>>,
    next_send_error: Mutex<Option<TransportError>>,
    events: Mutex<Option<TransportEvents>>,
    sends: Mutex<Vec<SentTask>>,
    cancels: Mutex<Vec<TaskId>>,
    foreground: Mutex<Vec<bool>>,
}

impl MockTransport {
    /// Connects as soon as the dispatcher binds it.
    pub fn connecting() -> Self {
        let mock = Self::default();
        mock.connect_on_bind.store(true, Ordering::SeqCst);
        mock
    }

    /// Stays unlinked until the test calls [`MockTransport::connect`].
    pub fn unlinked() -> Self {
        Self::default()
    }

    pub fn with_send_delay(self, delay: Duration) -> Self {
        *self.send_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn connect(&self) {
        self.ready.store(true, Ordering::SeqCst);
        if let Some(events) = self.events() {
            events.on_connected();
        }
    }

    pub fn disconnect(&self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Some(events) = self.events() {
            events.on_disconnected();
        }
    }

    pub fn fail_cancels(&self) {
        self.fail_cancels.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_send(&self, error: TransportError) {
        *self.next_send_error.lock().unwrap() = Some(error);
    }

    pub fn events(&self) -> Option<TransportEvents> {
        self.events.lock().unwrap().clone()
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> Vec<SentTask> {
        self.sends.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<TaskId> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn foreground(&self) -> Vec<bool> {
        self.foreground.lock().unwrap().clone()
    }

    /// Wait until at least `n` sends were accepted.
    pub async fn wait_for_sends(&self, n: usize) -> Vec<SentTask> {
        eventually(|| self.sends.lock().unwrap().len() >= n).await;
        self.sends()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn bind(&self, events: TransportEvents) -> Result<(), TransportError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        *self.events.lock().unwrap() = Some(events);
        if self.connect_on_bind.load(Ordering::SeqCst) {
            self.connect();
        }
        Ok(())
    }

    async fn send(
        &self,
        payload: Bytes,
        properties: &TaskProperties,
    ) -> Result<TaskId, TransportError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let error = self.next_send_error.lock().unwrap().take();
        if let Some(error) = error {
            if error == TransportError::Unavailable {
                self.ready.store(false, Ordering::SeqCst);
            }
            return Err(error);
        }
        let task_id = TaskId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.sends.lock().unwrap().push(SentTask {
            task_id,
            payload,
            properties: properties.clone(),
        });
        Ok(task_id)
    }

    async fn cancel(&self, task_id: TaskId) -> Result<(), TransportError> {
        self.cancels.lock().unwrap().push(task_id);
        if self.fail_cancels.load(Ordering::SeqCst) {
            return Err(TransportError::Other("cancel refused".into()));
        }
        Ok(())
    }

    async fn set_foreground(&self, foreground: bool) -> Result<(), TransportError> {
        self.foreground.lock().unwrap().push(foreground);
        Ok(())
    }
}

/// Poll `cond` until it holds; panics after two seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
