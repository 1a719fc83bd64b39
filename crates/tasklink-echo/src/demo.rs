//! Drives a dispatcher over the loopback transport and reports what happened.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tasklink::{
    BinaryCodec, Dispatcher, DispatcherConfig, DispatcherSnapshot, PushMessage, Task, TaskError,
    TaskHooks, TaskProperties, Transport,
};

use crate::loopback::{FAIL_PATH, LoopbackTransport};

/// Command id the demo uses for server pushes.
pub const NOTICE_CMD_ID: u32 = 1001;

#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    #[error("task {index} failed: {source}")]
    Task {
        index: usize,
        #[source]
        source: TaskError,
    },
    #[error("task {index} echoed {got:?}, expected {expected:?}")]
    Mismatch {
        index: usize,
        expected: String,
        got: String,
    },
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub count: usize,
    pub timeout: Duration,
    pub latency: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            count: 3,
            timeout: Duration::from_secs(5),
            latency: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub echoed: usize,
    pub failed_as_expected: bool,
    pub pushes: usize,
    pub snapshot: DispatcherSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Message {
    seq: u32,
    text: String,
    sent_at_ms: u64,
}

/// Fills the send timestamp right before encoding.
struct Stamp;

impl TaskHooks<Message, Message> for Stamp {
    fn before_encode(&mut self, request: &mut Message) {
        request.sent_at_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
    }
}

pub async fn run(options: DemoOptions) -> Result<DemoReport, EchoError> {
    let loopback = Arc::new(LoopbackTransport::new(options.latency));
    let transport: Arc<dyn Transport> = loopback.clone();
    let config = DispatcherConfig::new().with_default_timeout(options.timeout);
    let dispatcher = Dispatcher::spawn(transport, config);
    dispatcher.cmd_ids().insert("/echo/binary", 7);

    let pushes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pushes);
    dispatcher
        .push_router()
        .register(NOTICE_CMD_ID, move |msg: PushMessage| {
            tracing::info!(cmd_id = msg.cmd_id, len = msg.payload.len(), "Notice received");
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let handles: Vec<_> = (0..options.count)
        .map(|i| {
            let request = Message {
                seq: i as u32,
                text: format!("hello #{i}"),
                sent_at_ms: 0,
            };
            let task = Task::new(
                TaskProperties::new("", "/echo/binary"),
                BinaryCodec::<Message, Message>::new(),
                request,
            )
            .with_hooks(Stamp);
            dispatcher.submit(task)
        })
        .collect();

    let mut echoed = 0;
    for (index, handle) in handles.into_iter().enumerate() {
        let response = handle
            .wait_default()
            .await
            .map_err(|source| EchoError::Task { index, source })?;
        let expected = format!("hello #{index}");
        if response.text != expected {
            return Err(EchoError::Mismatch {
                index,
                expected,
                got: response.text,
            });
        }
        echoed += 1;
    }

    let failing = dispatcher.submit(Task::json(
        TaskProperties::new("", FAIL_PATH),
        serde_json::json!({"reason": "demo"}),
    ));
    let failed_as_expected = matches!(
        failing.wait(options.timeout).await,
        Err(TaskError::Failed { .. })
    );

    loopback.push(NOTICE_CMD_ID, Bytes::from_static(b"{\"notice\":\"done\"}"));

    let snapshot = dispatcher.snapshot();
    dispatcher.shutdown().await;

    Ok(DemoReport {
        echoed,
        failed_as_expected,
        pushes: pushes.load(Ordering::SeqCst),
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_round_trips_everything() {
        let report = run(DemoOptions {
            count: 4,
            timeout: Duration::from_secs(2),
            latency: Duration::ZERO,
        })
        .await
        .unwrap();

        assert_eq!(report.echoed, 4);
        assert!(report.failed_as_expected);
        assert_eq!(report.pushes, 1);
        assert_eq!(report.snapshot.in_flight, 0);
        assert!(report.snapshot.linked);
        assert!(report.snapshot.version.transport.is_some());
    }

    #[test]
    fn error_messages() {
        let err = EchoError::Task {
            index: 2,
            source: TaskError::Cancelled,
        };
        insta::assert_snapshot!(err, @"task 2 failed: task cancelled");
    }
}
