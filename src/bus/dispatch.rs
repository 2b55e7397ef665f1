//! Broker core: subscriptions, handler registry and message dispatch.
//!
//! Every adapter owns one `BrokerCore` and hands it what arrives on the
//! transport. The core decides whether an envelope is a reply (resolve the
//! pending call) or an event (decode and run handlers), and reports the
//! outcome so the adapter can settle the delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::codec::{Codec, MsgPackCodec};
use super::correlation::{CorrelationTable, PendingReply};
use super::{
    BrokerError, BrokerEvent, Envelope, Message, MessageHandler, Responder, Result, SendOptions,
};

/// Capacity of the broker event channel. Slow observers lag, they never block.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of dispatching one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// All handlers succeeded.
    Success,
    /// The envelope resolved a pending call.
    Reply,
    /// Nothing is registered for the event.
    NoHandlers,
    /// One or more handlers failed, consider redelivery.
    HandlerFailed,
    /// The payload could not be decoded, no retry will help.
    DecodeError,
}

impl DispatchResult {
    /// Returns true if all handlers succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

type Handlers = BTreeMap<String, Vec<Arc<dyn MessageHandler>>>;

/// State shared by every adapter.
pub struct BrokerCore {
    codec: Arc<dyn Codec>,
    subscribed: RwLock<BTreeSet<String>>,
    handlers: RwLock<Handlers>,
    correlations: CorrelationTable,
    events: broadcast::Sender<BrokerEvent>,
}

impl BrokerCore {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            codec,
            subscribed: RwLock::new(BTreeSet::new()),
            handlers: RwLock::new(BTreeMap::new()),
            correlations: CorrelationTable::new(),
            events,
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn correlations(&self) -> &CorrelationTable {
        &self.correlations
    }

    pub fn encode(&self, value: &Value) -> Result<Bytes> {
        self.codec.encode(value)
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Value> {
        self.codec.decode(payload)
    }

    // ------------------------------------------------------------------
    // Subscribed set
    // ------------------------------------------------------------------

    /// Add events to the subscribed set. Returns the ones not already present.
    pub fn add_events(&self, events: &[&str]) -> Vec<String> {
        let mut subscribed = self
            .subscribed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .filter(|event| subscribed.insert(event.to_string()))
            .map(|event| event.to_string())
            .collect()
    }

    /// Remove events from the subscribed set. Returns the ones that were present.
    pub fn remove_events(&self, events: &[&str]) -> Vec<String> {
        let mut subscribed = self
            .subscribed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .filter(|event| subscribed.remove(**event))
            .map(|event| event.to_string())
            .collect()
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.subscribed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(event)
    }

    /// Snapshot of the subscribed set, in name order.
    pub fn subscribed_events(&self) -> Vec<String> {
        self.subscribed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Register a closure handler for `event`. Handlers run in registration order.
    pub fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_handler(event, handler);
    }

    /// Register a handler for `event`.
    pub fn add_handler<H: MessageHandler + 'static>(&self, event: &str, handler: H) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Remove every handler registered for `event`.
    pub fn off(&self, event: &str) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    fn handlers_for(&self, event: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: BrokerEvent) {
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(event);
    }

    pub fn emit_error(&self, error: BrokerError) {
        self.emit(BrokerEvent::Error(Arc::new(error)));
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch an envelope that arrived on a shared path.
    ///
    /// A correlation id with a pending entry makes the envelope a reply: the
    /// call is resolved and no handler runs. Anything else is delivered.
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        responder: Arc<dyn Responder>,
    ) -> DispatchResult {
        if let Some(id) = envelope.correlation_id.as_deref() {
            if self.correlations.contains(id) {
                self.correlations.resolve(id, envelope.payload.clone());
                return DispatchResult::Reply;
            }
        }
        self.deliver(&envelope.event, &envelope.payload, responder).await
    }

    /// Resolve a pending call from a dedicated reply path.
    pub fn resolve_reply(&self, id: &str, payload: Bytes) -> bool {
        self.correlations.resolve(id, payload)
    }

    /// Decode a payload and run every handler registered for `event`.
    pub async fn deliver(
        &self,
        event: &str,
        payload: &[u8],
        responder: Arc<dyn Responder>,
    ) -> DispatchResult {
        let data = match self.codec.decode(payload) {
            Ok(data) => data,
            Err(e) => {
                error!(event = %event, error = %e, "Failed to decode payload");
                self.emit_error(BrokerError::MalformedEnvelope(format!("{}: {}", event, e)));
                return DispatchResult::DecodeError;
            }
        };

        let handlers = self.handlers_for(event);
        if handlers.is_empty() {
            debug!(event = %event, "No handlers registered, message not handled");
            return DispatchResult::NoHandlers;
        }

        let message = Message::new(event, data, Arc::clone(&self.codec), responder);
        let mut all_succeeded = true;

        for handler in handlers {
            if let Err(e) = handler.handle(message.clone()).await {
                warn!(event = %event, error = %e, "Handler failed");
                self.emit_error(BrokerError::handler(event, e));
                all_succeeded = false;
            }
        }

        if all_succeeded {
            DispatchResult::Success
        } else {
            DispatchResult::HandlerFailed
        }
    }

    /// Wait for a pending call and decode its reply.
    pub async fn await_reply(&self, pending: PendingReply, options: &SendOptions) -> Result<Value> {
        let payload = pending.wait(options.expiration()).await?;
        self.codec.decode(&payload)
    }
}

impl Default for BrokerCore {
    fn default() -> Self {
        Self::new(Arc::new(MsgPackCodec))
    }
}

impl std::fmt::Debug for BrokerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCore")
            .field("codec", &self.codec.name())
            .field("subscribed", &self.subscribed_events())
            .field("pending_calls", &self.correlations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingResponder {
        acks: AtomicUsize,
        replies: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl Responder for RecordingResponder {
        async fn ack(&self) -> Result<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reply(&self, payload: Bytes) -> Result<()> {
            self.replies.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn encoded(core: &BrokerCore, value: Value) -> Bytes {
        core.encode(&value).unwrap()
    }

    #[test]
    fn test_add_events_is_idempotent() {
        let core = BrokerCore::default();
        assert_eq!(core.add_events(&["a", "b"]), vec!["a", "b"]);
        assert_eq!(core.add_events(&["b", "c"]), vec!["c"]);
        assert_eq!(core.subscribed_events(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_unknown_event_is_noop() {
        let core = BrokerCore::default();
        core.add_events(&["a"]);
        assert!(core.remove_events(&["missing"]).is_empty());
        assert_eq!(core.remove_events(&["a", "a"]), vec!["a"]);
        assert!(core.subscribed_events().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_runs_handlers_in_order() {
        let core = BrokerCore::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            core.on("greet", move |msg: Message| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(format!("{}:{}", tag, msg.data()));
                    Ok(())
                }
            });
        }

        let responder = Arc::new(RecordingResponder::default());
        let payload = encoded(&core, json!("hi"));
        let result = core.deliver("greet", &payload, responder).await;

        assert_eq!(result, DispatchResult::Success);
        assert_eq!(*seen.lock().unwrap(), vec!["first:\"hi\"", "second:\"hi\""]);
    }

    #[tokio::test]
    async fn test_ack_reaches_transport_once() {
        let core = BrokerCore::default();
        core.on("greet", |msg: Message| async move {
            msg.ack().await?;
            msg.ack().await?;
            msg.reply(&json!("hello")).await
        });
        core.on("greet", |msg: Message| async move {
            assert!(msg.is_acked());
            msg.ack().await
        });

        let responder = Arc::new(RecordingResponder::default());
        let payload = encoded(&core, json!("hi"));
        let result = core.deliver("greet", &payload, responder.clone()).await;

        assert_eq!(result, DispatchResult::Success);
        assert_eq!(responder.acks.load(Ordering::SeqCst), 1);
        let replies = responder.replies.lock().unwrap();
        assert_eq!(core.decode(&replies[0]).unwrap(), json!("hello"));
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let core = BrokerCore::default();
        let mut events = core.events();
        core.on("boom", |msg: Message| async move {
            Err(BrokerError::handler(msg.event(), "exploded"))
        });

        let payload = encoded(&core, json!(null));
        let result = core
            .deliver("boom", &payload, Arc::new(RecordingResponder::default()))
            .await;

        assert_eq!(result, DispatchResult::HandlerFailed);
        match events.recv().await.unwrap() {
            BrokerEvent::Error(e) => assert!(matches!(*e, BrokerError::Handler { .. })),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_reported() {
        let core = BrokerCore::default();
        let mut events = core.events();
        core.on("x", |_msg: Message| async { Ok(()) });

        let result = core
            .deliver("x", &[0xc1], Arc::new(RecordingResponder::default()))
            .await;

        assert_eq!(result, DispatchResult::DecodeError);
        assert!(matches!(
            events.recv().await.unwrap(),
            BrokerEvent::Error(e) if matches!(*e, BrokerError::MalformedEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn test_no_handlers() {
        let core = BrokerCore::default();
        let payload = encoded(&core, json!("x"));
        let result = core
            .deliver("ping", &payload, Arc::new(RecordingResponder::default()))
            .await;
        assert_eq!(result, DispatchResult::NoHandlers);
    }

    #[tokio::test]
    async fn test_dispatch_resolves_pending_call() {
        let core = BrokerCore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            core.on("greet", move |_msg: Message| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            });
        }

        let pending = core.correlations().register("id-1").unwrap();
        let reply = Envelope::correlated("greet", encoded(&core, json!("hello")), "id-1");
        let result = core
            .dispatch(reply, Arc::new(RecordingResponder::default()))
            .await;

        assert_eq!(result, DispatchResult::Reply);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let value = core
            .await_reply(pending, &SendOptions::with_expiration(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(value, json!("hello"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_correlation_is_delivered() {
        let core = BrokerCore::default();
        core.on("greet", |_msg: Message| async { Ok(()) });

        let request = Envelope::correlated("greet", encoded(&core, json!("hi")), "remote-id");
        let result = core
            .dispatch(request, Arc::new(RecordingResponder::default()))
            .await;

        assert_eq!(result, DispatchResult::Success);
    }
}
