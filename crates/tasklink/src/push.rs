//! Routing of unsolicited server messages.
//!
//! Handlers run inline on the transport's notification call. A slow handler
//! delays every push behind it, so long work belongs on a spawned task.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

/// A server-initiated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub cmd_id: u32,
    pub payload: Bytes,
}

impl PushMessage {
    pub fn new(cmd_id: u32, payload: Bytes) -> Self {
        Self { cmd_id, payload }
    }
}

pub trait PushHandler: Send + Sync {
    fn process(&self, message: PushMessage);
}

impl<F> PushHandler for F
where
    F: Fn(PushMessage) + Send + Sync,
{
    fn process(&self, message: PushMessage) {
        self(message)
    }
}

/// Command id -> handler, at most one handler per id.
#[derive(Default)]
pub struct PushRouter {
    handlers: DashMap<u32, Arc<dyn PushHandler>>,
}

impl PushRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the handler for `cmd_id`; `None` removes it.
    pub fn set_handler(&self, cmd_id: u32, handler: Option<Arc<dyn PushHandler>>) {
        match handler {
            Some(handler) => {
                if self.handlers.insert(cmd_id, handler).is_some() {
                    tracing::debug!(target: "tasklink::push", cmd_id, "Replaced push handler");
                }
            }
            None => {
                self.handlers.remove(&cmd_id);
            }
        }
    }

    pub fn register(&self, cmd_id: u32, handler: impl PushHandler + 'static) {
        self.set_handler(cmd_id, Some(Arc::new(handler)));
    }

    pub fn unregister(&self, cmd_id: u32) {
        self.set_handler(cmd_id, None);
    }

    pub fn has_handler(&self, cmd_id: u32) -> bool {
        self.handlers.contains_key(&cmd_id)
    }

    /// Hand `payload` to the handler for `cmd_id`. Returns false when no
    /// handler is registered; the message is then dropped.
    pub fn dispatch(&self, cmd_id: u32, payload: Bytes) -> bool {
        // Clone out of the map so the shard lock is not held while the
        // handler runs (a handler may re-register itself).
        let handler = self.handlers.get(&cmd_id).map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => {
                tracing::info!(target: "tasklink::push", cmd_id, payload_len = payload.len(), "Processing push message");
                handler.process(PushMessage::new(cmd_id, payload));
                true
            }
            None => {
                tracing::info!(target: "tasklink::push", cmd_id, "No push handler registered, ignored");
                false
            }
        }
    }
}

impl fmt::Debug for PushRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<u32> = self.handlers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        f.debug_struct("PushRouter").field("cmd_ids", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<PushMessage>>>, impl PushHandler + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |msg: PushMessage| sink.lock().unwrap().push(msg))
    }

    #[test]
    fn dispatch_invokes_handler_with_exact_bytes() {
        let router = PushRouter::new();
        let (seen, handler) = recorder();
        router.register(1001, handler);

        let handled = router.dispatch(1001, Bytes::from_static(&[0, 159, 146, 150]));

        assert!(handled);
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![PushMessage::new(1001, Bytes::from_static(&[0, 159, 146, 150]))]
        );
    }

    #[test]
    fn dispatch_without_handler_is_not_handled() {
        let router = PushRouter::new();
        let (seen, handler) = recorder();
        router.register(1, handler);

        assert!(!router.dispatch(2, Bytes::from_static(b"hello")));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn registering_replaces_previous_handler() {
        let router = PushRouter::new();
        let (first, h1) = recorder();
        let (second, h2) = recorder();
        router.register(5, h1);
        router.register(5, h2);

        router.dispatch(5, Bytes::from_static(b"x"));

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn absent_handler_unregisters() {
        let router = PushRouter::new();
        let (_seen, handler) = recorder();
        router.register(9, handler);
        assert!(router.has_handler(9));

        router.set_handler(9, None);

        assert!(!router.has_handler(9));
        assert!(!router.dispatch(9, Bytes::new()));
    }

    #[test]
    fn handler_may_reregister_itself() {
        let router = Arc::new(PushRouter::new());
        let inner = Arc::clone(&router);
        router.register(3, move |_msg: PushMessage| {
            inner.unregister(3);
        });

        assert!(router.dispatch(3, Bytes::new()));
        assert!(!router.has_handler(3));
    }

    #[test]
    fn concurrent_register_and_dispatch() {
        let router = Arc::new(PushRouter::new());
        let (seen, handler) = recorder();
        let handler: Arc<dyn PushHandler> = Arc::new(handler);

        let threads: Vec<_> = (0..4u32)
            .map(|i| {
                let router = Arc::clone(&router);
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || {
                    router.set_handler(i, Some(handler));
                    for _ in 0..100 {
                        router.dispatch(i, Bytes::from_static(b"p"));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(seen.lock().unwrap().len(), 400);
    }
}
