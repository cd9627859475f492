//! The transport seam between the runtime and an HMR server

use crate::hmr::payload::HmrPayload;
use crate::Result;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives payloads from a connection.
///
/// The returned future resolves once the payload has been processed; the
/// payload is queued as soon as the handler is called.
pub type UpdateHandler = Arc<dyn Fn(HmrPayload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A bidirectional HMR channel
pub trait HmrConnection: Send + Sync {
    /// Whether outgoing messages can be sent right now
    fn is_ready(&self) -> bool;

    /// Send an encoded message to the server
    fn send(&self, message: String);

    /// Register the handler that receives incoming payloads
    fn on_update(&self, handler: UpdateHandler);
}

#[derive(Default)]
struct MemoryState {
    offline: AtomicBool,
    sent: Mutex<Vec<String>>,
    handler: RwLock<Option<UpdateHandler>>,
}

/// In-process connection: payloads are delivered by calling
/// [`MemoryConnection::deliver`], sent messages are recorded
#[derive(Clone, Default)]
pub struct MemoryConnection {
    state: Arc<MemoryState>,
}

impl MemoryConnection {
    /// Create a ready connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle readiness; messages sent while not ready stay buffered by the
    /// client
    pub fn set_ready(&self, ready: bool) {
        self.state.offline.store(!ready, Ordering::Release);
    }

    /// Messages sent so far
    pub fn sent_messages(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    /// Whether a handler has been registered
    pub fn has_handler(&self) -> bool {
        self.state.handler.read().is_some()
    }

    /// Hand a payload to the registered handler.
    ///
    /// The payload is enqueued before this returns; await the future to wait
    /// for it to be processed.
    pub fn deliver(&self, payload: HmrPayload) -> BoxFuture<'static, Result<()>> {
        let handler = self.state.handler.read().clone();
        match handler {
            Some(handler) => handler(payload),
            None => future::ready(Ok(())).boxed(),
        }
    }

    /// Decode and deliver a JSON payload
    pub fn deliver_json(&self, text: &str) -> BoxFuture<'static, Result<()>> {
        match HmrPayload::from_json(text) {
            Ok(payload) => self.deliver(payload),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }
}

impl HmrConnection for MemoryConnection {
    fn is_ready(&self) -> bool {
        !self.state.offline.load(Ordering::Acquire)
    }

    fn send(&self, message: String) {
        self.state.sent.lock().push(message);
    }

    fn on_update(&self, handler: UpdateHandler) {
        *self.state.handler.write() = Some(handler);
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("ready", &self.is_ready())
            .field("sent", &self.state.sent.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_deliver_without_handler_is_noop() {
        let connection = MemoryConnection::new();
        assert!(!connection.has_handler());
        connection.deliver(HmrPayload::Connected).await.unwrap();
    }

    #[tokio::test]
    async fn test_deliver_reaches_handler() {
        let connection = MemoryConnection::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        connection.on_update(Arc::new(move |_payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(())).boxed()
        }));

        connection.deliver(HmrPayload::Connected).await.unwrap();
        connection.deliver_json(r#"{"type":"connected"}"#).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(connection.deliver_json(r#"{"type":"bogus"}"#).await.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_records_sent_messages() {
        let connection = MemoryConnection::new();
        assert!(connection.is_ready());
        connection.send("a".to_string());
        assert_eq!(connection.sent_messages(), vec!["a".to_string()]);

        connection.set_ready(false);
        assert!(!connection.is_ready());
    }
}
