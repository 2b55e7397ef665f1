//! Message brokers.
//!
//! This module contains:
//! - `Broker` trait: publish, call, subscribe and unsubscribe over one transport
//! - `MessageHandler` trait and `Message`: what subscribers receive
//! - `Responder` trait: per-transport `ack`/`reply` capability
//! - Broker configuration types and the `init_broker` factory
//! - Implementations: AMQP (RabbitMQ), Redis streams, process IPC

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod codec;
pub mod correlation;
pub mod dispatch;
pub mod ipc;
pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpOptions, ConnectionState};
pub use codec::{Codec, CodecKind, JsonCodec, MsgPackCodec};
pub use correlation::{CorrelationTable, PendingReply};
pub use dispatch::{BrokerCore, DispatchResult};
pub use ipc::{IpcBroker, IpcChannel, IpcMessage, IpcOptions};
pub use mock::MockBroker;
#[cfg(feature = "redis")]
pub use self::redis::{RedisBroker, RedisOptions};

/// Default time a `call` waits for its reply.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_millis(5000);

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Not connected: no channel available")]
    NotConnected,

    #[error("No route: no children attached and no parent channel")]
    NoRoute,

    #[error("Call {id} exceeded time limit of {after:?}")]
    Timeout { id: String, after: Duration },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Subscribe failed for {} event(s): {}", .failures.len(), describe_failures(.failures))]
    PartialSubscribe { failures: Vec<(String, BrokerError)> },

    #[error("Unsubscribe failed for {} event(s): {}", .failures.len(), describe_failures(.failures))]
    PartialUnsubscribe { failures: Vec<(String, BrokerError)> },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Handler for '{event}' failed: {message}")]
    Handler { event: String, message: String },

    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl BrokerError {
    /// Build a handler failure for `event`.
    pub fn handler(event: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BrokerError::Handler {
            event: event.into(),
            message: message.to_string(),
        }
    }

    /// True when no reply arrived within the call's window.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout { .. })
    }

    /// True when the operation failed because there was nothing to send on.
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(self, BrokerError::NotConnected | BrokerError::NoRoute)
    }
}

fn describe_failures(failures: &[(String, BrokerError)]) -> String {
    failures
        .iter()
        .map(|(event, e)| format!("{}: {}", event, e))
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Envelope and delivery
// ============================================================================

/// The unit that crosses a transport.
///
/// A correlation id is present only on RPC requests and on their replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub event: String,
    pub payload: Bytes,
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// A fire-and-forget envelope.
    pub fn event(event: impl Into<String>, payload: Bytes) -> Self {
        Self {
            event: event.into(),
            payload,
            correlation_id: None,
        }
    }

    /// An envelope addressed by correlation id (request or reply).
    pub fn correlated(event: impl Into<String>, payload: Bytes, id: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            payload,
            correlation_id: Some(id.into()),
        }
    }
}

/// Transport side of the response capability attached to a delivery.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Acknowledge the delivery to the transport.
    async fn ack(&self) -> Result<()>;

    /// Send an encoded reply back to the original caller.
    async fn reply(&self, payload: Bytes) -> Result<()>;
}

/// A delivered message: the decoded payload plus `ack`/`reply` controls.
///
/// Clones share acknowledgment state, so every handler of one delivery sees
/// the same `is_acked`.
#[derive(Clone)]
pub struct Message {
    event: String,
    data: Value,
    codec: Arc<dyn Codec>,
    responder: Arc<dyn Responder>,
    acked: Arc<AtomicBool>,
}

impl Message {
    pub fn new(
        event: impl Into<String>,
        data: Value,
        codec: Arc<dyn Codec>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            event: event.into(),
            data,
            codec,
            responder,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Deserialize the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| BrokerError::Codec(format!("payload for '{}': {}", self.event, e)))
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// Acknowledge the delivery. Only the first call reaches the transport.
    pub async fn ack(&self) -> Result<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.responder.ack().await;
        if result.is_err() {
            self.acked.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Reply to the caller that issued this message.
    pub async fn reply(&self, data: &Value) -> Result<()> {
        let payload = self.codec.encode(data)?;
        self.responder.reply(payload).await
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("event", &self.event)
            .field("data", &self.data)
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Handler for messages delivered to a subscribed event.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Message) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(message))
    }
}

/// Broker-level notifications for the owning process.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A systemic failure: malformed envelope, handler failure, read loop exit.
    Error(Arc<BrokerError>),
    /// The transport connection closed.
    Closed { reason: String },
    /// The transport connection was re-established.
    Reconnected,
}

/// Options for `publish` and `call`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// How long `call` waits for a reply. Defaults to [`DEFAULT_EXPIRATION`].
    pub expiration: Option<Duration>,
}

impl SendOptions {
    pub fn with_expiration(expiration: Duration) -> Self {
        Self {
            expiration: Some(expiration),
        }
    }

    pub fn expiration(&self) -> Duration {
        self.expiration.unwrap_or(DEFAULT_EXPIRATION)
    }
}

// ============================================================================
// Broker trait
// ============================================================================

/// A message broker over one transport.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `RedisBroker`: Redis stream consumer groups
/// - `IpcBroker`: parent/child process channels
#[async_trait]
pub trait Broker: Send + Sync {
    /// Shared state: codec, subscriptions, handlers, pending calls.
    fn core(&self) -> &BrokerCore;

    /// Publish an event. Resolves once the transport accepted the write.
    async fn publish(&self, event: &str, data: &Value, options: &SendOptions) -> Result<()>;

    /// Call a remote method and wait for its reply.
    async fn call(&self, method: &str, data: &Value, options: &SendOptions) -> Result<Value>;

    /// Transport registration for one newly subscribed event.
    async fn register(&self, event: &str) -> Result<()>;

    /// Transport teardown for one unsubscribed event. No-op when unregistered.
    async fn unregister(&self, event: &str) -> Result<()>;

    /// Runs after every `subscribe`, once all registrations settled.
    async fn after_subscribe(&self) -> Result<()> {
        Ok(())
    }

    /// Release transport resources.
    async fn disconnect(&self) -> Result<()>;

    /// Subscribe to events.
    ///
    /// Events already subscribed are not registered again. Events whose
    /// registration fails are removed from the subscribed set and reported
    /// together in `PartialSubscribe`.
    async fn subscribe(&self, events: &[&str]) -> Result<()> {
        let added = self.core().add_events(events);

        let results = join_all(added.iter().map(|event| async move {
            (event.clone(), self.register(event).await)
        }))
        .await;

        let mut failures = Vec::new();
        for (event, result) in results {
            if let Err(e) = result {
                warn!(event = %event, error = %e, "Subscription failed");
                self.core().remove_events(&[event.as_str()]);
                failures.push((event, e));
            }
        }

        self.after_subscribe().await?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::PartialSubscribe { failures })
        }
    }

    /// Unsubscribe from events. Unknown events are ignored.
    async fn unsubscribe(&self, events: &[&str]) -> Result<()> {
        let removed = self.core().remove_events(events);

        let results = join_all(removed.iter().map(|event| async move {
            (event.clone(), self.unregister(event).await)
        }))
        .await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(event, result)| result.err().map(|e| (event, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::PartialUnsubscribe { failures })
        }
    }

    /// Observe broker-level notifications.
    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.core().events()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// AMQP/RabbitMQ.
    Amqp,
    /// Redis streams.
    #[default]
    Redis,
    /// Parent process channel over stdio.
    Ipc,
}

/// Broker configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// Exchange name (AMQP) or consumer group name (Redis).
    pub group: String,
    /// Payload codec.
    pub codec: CodecKind,
    /// AMQP-specific configuration.
    pub amqp: AmqpBrokerConfig,
    /// Redis-specific configuration.
    pub redis: RedisBrokerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::default(),
            group: "default".to_string(),
            codec: CodecKind::default(),
            amqp: AmqpBrokerConfig::default(),
            redis: RedisBrokerConfig::default(),
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Extra queue-name qualifier.
    pub subgroup: Option<String>,
    /// Delay between reconnection attempts.
    pub reconnect_timeout_ms: u64,
    /// Consumer prefetch (basic.qos), unlimited when unset.
    pub prefetch: Option<u16>,
    /// Declare event queues durable.
    pub durable: bool,
}

impl Default for AmqpBrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            subgroup: None,
            reconnect_timeout_ms: 10_000,
            prefetch: None,
            durable: true,
        }
    }
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisBrokerConfig {
    /// Redis connection URL.
    pub url: String,
    /// BLOCK argument of the group read, in milliseconds.
    pub block_interval_ms: u64,
    /// COUNT argument of the group read.
    pub max_chunk: usize,
    /// Consumer name; random when unset.
    pub name: Option<String>,
    /// Idle time after which an empty consumer is swept on unsubscribe.
    pub stale_consumer_idle_ms: u64,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            block_interval_ms: 5000,
            max_chunk: 10,
            name: None,
            stale_consumer_idle_ms: 3_600_000,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp` (included in default)
/// - Redis: `--features redis` (included in default)
pub async fn init_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    let codec = config.codec.build();

    match config.broker_type {
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let options = AmqpOptions {
                    subgroup: config.amqp.subgroup.clone(),
                    reconnect_timeout: Duration::from_millis(config.amqp.reconnect_timeout_ms),
                    durable: config.amqp.durable,
                    prefetch: config.amqp.prefetch,
                    codec,
                };
                let broker = AmqpBroker::new(&config.group, options);
                broker.connect(&config.amqp.url).await?;
                info!(broker_type = "amqp", group = %config.group, "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BrokerError::Config(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        BrokerType::Redis => {
            #[cfg(feature = "redis")]
            {
                let options = RedisOptions {
                    name: config.redis.name.clone(),
                    block_interval: Duration::from_millis(config.redis.block_interval_ms),
                    max_chunk: config.redis.max_chunk,
                    stale_consumer_idle: Duration::from_millis(
                        config.redis.stale_consumer_idle_ms,
                    ),
                    codec,
                };
                let broker = RedisBroker::connect(&config.redis.url, &config.group, options).await?;
                info!(broker_type = "redis", group = %config.group, "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err(BrokerError::Config(
                    "Redis support requires the 'redis' feature. Rebuild with --features redis"
                        .to_string(),
                ))
            }
        }
        BrokerType::Ipc => {
            let options = IpcOptions { codec };
            let broker = IpcBroker::new(Some(IpcChannel::from_stdio()), options);
            info!(broker_type = "ipc", "Broker initialized");
            Ok(Arc::new(broker))
        }
    }
}
