//! Redis streams broker implementation.
//!
//! Each event is a stream key and the broker group is a consumer group on it,
//! so every entry reaches exactly one consumer of the group. One blocking
//! group read covers all subscribed streams. RPC replies travel over pub/sub
//! channels named `{event}:{entry_id}`.
//!
//! Connections per broker:
//! - `ConnectionManager` for ordinary commands
//! - a dedicated connection for the blocking `XREADGROUP`
//! - a pub/sub connection owned by the reply listener task

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection, PubSub};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisResult, Script};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec::{Codec, MsgPackCodec};
use super::{Broker, BrokerCore, BrokerError, DispatchResult, Responder, Result, SendOptions};

/// Stream entry field carrying the encoded payload.
pub const DATA_FIELD: &str = "data";

const LEAVE_GROUP_SCRIPT: &str = include_str!("leave_group.lua");

/// Configuration for the Redis broker.
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// Consumer name within the group. Random when unset.
    pub name: Option<String>,
    /// How long one group read blocks waiting for entries.
    pub block_interval: Duration,
    /// Entries read per stream per call.
    pub max_chunk: usize,
    /// Other consumers idle this long with nothing pending are swept on unsubscribe.
    pub stale_consumer_idle: Duration,
    pub codec: Arc<dyn Codec>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            name: None,
            block_interval: Duration::from_millis(5000),
            max_chunk: 10,
            stale_consumer_idle: Duration::from_secs(3600),
            codec: Arc::new(MsgPackCodec),
        }
    }
}

/// 40 hex characters.
fn random_consumer_name() -> String {
    hex::encode(rand::random::<[u8; 20]>())
}

/// Pub/sub channel that carries the reply to one stream entry.
pub fn reply_channel(event: &str, entry_id: &str) -> String {
    format!("{}:{}", event, entry_id)
}

enum ReplyCommand {
    Subscribe(String, oneshot::Sender<RedisResult<()>>),
    Unsubscribe(String),
}

struct RedisInner {
    core: BrokerCore,
    group: String,
    name: String,
    options: RedisOptions,
    /// Taken on disconnect, along with `reader` and `replies`.
    conn: RwLock<Option<ConnectionManager>>,
    reader: Mutex<Option<MultiplexedConnection>>,
    replies: Mutex<Option<mpsc::Sender<ReplyCommand>>>,
    /// Streams whose consumer group exists; only these are read.
    active: RwLock<BTreeSet<String>>,
    listening: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
    leave_group: Script,
}

impl RedisInner {
    fn conn(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn replies(&self) -> Option<mpsc::Sender<ReplyCommand>> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active_streams(&self) -> Vec<String> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Create the group at the start of the stream, creating the stream too.
    async fn ensure_group(&self, event: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let created: RedisResult<()> = conn.xgroup_create_mkstream(event, &self.group, "0").await;

        match created {
            Ok(()) => debug!(stream = %event, group = %self.group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %event, group = %self.group, "Consumer group already exists")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn start_reading(self: &Arc<Self>) {
        if self.active_streams().is_empty() {
            return;
        }
        let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let task = tokio::spawn(read_loop(Arc::downgrade(self), reader));
        *self.read_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    async fn handle_entry(&self, stream: &str, entry_id: &str, payload: Option<Vec<u8>>) {
        let Some(payload) = payload else {
            warn!(stream = %stream, id = %entry_id, "Stream entry has no data field, leaving it pending");
            self.core.emit_error(BrokerError::MalformedEnvelope(format!(
                "{} entry {} has no '{}' field",
                stream, entry_id, DATA_FIELD
            )));
            return;
        };
        let Ok(conn) = self.conn() else {
            debug!(stream = %stream, id = %entry_id, "Disconnected, leaving entry pending");
            return;
        };

        let responder = Arc::new(RedisResponder {
            conn,
            stream: stream.to_string(),
            group: self.group.clone(),
            entry_id: entry_id.to_string(),
        });

        match self.core.deliver(stream, &payload, responder.clone()).await {
            DispatchResult::NoHandlers => {
                if let Err(e) = responder.ack().await {
                    error!(stream = %stream, id = %entry_id, error = %e, "Failed to ack unhandled entry");
                }
            }
            DispatchResult::HandlerFailed | DispatchResult::DecodeError => {
                debug!(stream = %stream, id = %entry_id, "Entry left pending");
            }
            DispatchResult::Success | DispatchResult::Reply => {}
        }
    }

    async fn subscribe_reply(&self, channel: &str) -> Result<()> {
        let replies = self.replies().ok_or(BrokerError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        replies
            .send(ReplyCommand::Subscribe(channel.to_string(), tx))
            .await
            .map_err(|_| BrokerError::Connection("reply listener stopped".to_string()))?;
        rx.await
            .map_err(|_| BrokerError::Connection("reply listener stopped".to_string()))??;
        Ok(())
    }

    async fn unsubscribe_reply(&self, channel: String) {
        let Some(replies) = self.replies() else {
            return;
        };
        if replies
            .send(ReplyCommand::Unsubscribe(channel))
            .await
            .is_err()
        {
            debug!("Reply listener stopped before unsubscribe");
        }
    }
}

/// Read every active stream until an error or until none are left.
async fn read_loop(inner: Weak<RedisInner>, mut conn: MultiplexedConnection) {
    loop {
        let Some(broker) = inner.upgrade() else {
            return;
        };

        let streams = broker.active_streams();
        if streams.is_empty() {
            debug!(group = %broker.group, "No streams left, read loop stopping");
            broker.listening.store(false, Ordering::SeqCst);
            // A subscribe may have landed between the check and the store.
            broker.start_reading();
            return;
        }

        let ids = vec![">"; streams.len()];
        let options = StreamReadOptions::default()
            .group(&broker.group, &broker.name)
            .count(broker.options.max_chunk)
            .block(broker.options.block_interval.as_millis() as usize);

        // Not holding the broker across the blocking read lets it drop.
        drop(broker);
        let read: RedisResult<Option<StreamReadReply>> =
            conn.xread_options(&streams, &ids, &options).await;

        let Some(broker) = inner.upgrade() else {
            return;
        };

        let reply = match read {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => {
                error!(group = %broker.group, error = %e, "Stream read failed, read loop stopping");
                broker.listening.store(false, Ordering::SeqCst);
                broker.core.emit_error(e.into());
                return;
            }
        };

        for key in reply.keys {
            for entry in key.ids {
                let payload = entry.get::<Vec<u8>>(DATA_FIELD);
                broker.handle_entry(&key.key, &entry.id, payload).await;
            }
        }
    }
}

/// Owns the pub/sub connection; resolves calls as replies arrive.
async fn listen_replies(
    inner: Weak<RedisInner>,
    mut pubsub: PubSub,
    mut commands: mpsc::Receiver<ReplyCommand>,
) {
    loop {
        let command = {
            let messages = pubsub.on_message();
            tokio::pin!(messages);
            tokio::select! {
                command = commands.recv() => command,
                message = messages.next() => {
                    let Some(message) = message else {
                        warn!("Reply connection closed");
                        return;
                    };
                    if let Some(inner) = inner.upgrade() {
                        let payload = Bytes::copy_from_slice(message.get_payload_bytes());
                        inner.core.resolve_reply(message.get_channel_name(), payload);
                    }
                    continue;
                }
            }
        };

        match command {
            Some(ReplyCommand::Subscribe(channel, done)) => {
                let _ = done.send(pubsub.subscribe(&channel).await);
            }
            Some(ReplyCommand::Unsubscribe(channel)) => {
                if let Err(e) = pubsub.unsubscribe(&channel).await {
                    warn!(channel = %channel, error = %e, "Failed to unsubscribe reply channel");
                }
            }
            None => return,
        }
    }
}

/// Redis streams broker.
#[derive(Clone)]
pub struct RedisBroker {
    inner: Arc<RedisInner>,
}

impl RedisBroker {
    /// Connect to Redis and join `group` under this broker's consumer name.
    pub async fn connect(url: &str, group: &str, options: RedisOptions) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let reader = client.get_multiplexed_async_connection().await?;
        let pubsub = client.get_async_pubsub().await?;

        let name = options.name.clone().unwrap_or_else(random_consumer_name);
        let (replies, commands) = mpsc::channel(64);

        let inner = Arc::new(RedisInner {
            core: BrokerCore::new(Arc::clone(&options.codec)),
            group: group.to_string(),
            name,
            options,
            conn: RwLock::new(Some(conn)),
            reader: Mutex::new(Some(reader)),
            replies: Mutex::new(Some(replies)),
            active: RwLock::new(BTreeSet::new()),
            listening: AtomicBool::new(false),
            read_task: Mutex::new(None),
            leave_group: Script::new(LEAVE_GROUP_SCRIPT),
        });

        tokio::spawn(listen_replies(Arc::downgrade(&inner), pubsub, commands));

        info!(url = %url, group = %group, consumer = %inner.name, "Connected to Redis");
        Ok(Self { inner })
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Consumer name within the group.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the read loop is running.
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    async fn append(&self, event: &str, data: &Value) -> Result<String> {
        let mut conn = self.inner.conn()?;
        let payload = self.inner.core.encode(data)?;
        let id: String = conn
            .xadd(event, "*", &[(DATA_FIELD, &payload[..])])
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn core(&self) -> &BrokerCore {
        &self.inner.core
    }

    async fn publish(&self, event: &str, data: &Value, _options: &SendOptions) -> Result<()> {
        let id = self.append(event, data).await?;
        debug!(stream = %event, id = %id, "Published entry");
        Ok(())
    }

    async fn call(&self, method: &str, data: &Value, options: &SendOptions) -> Result<Value> {
        let id = self.append(method, data).await?;
        let channel = reply_channel(method, &id);

        let pending = self.inner.core.correlations().register(channel.clone())?;
        self.inner.subscribe_reply(&channel).await?;

        let result = self.inner.core.await_reply(pending, options).await;
        self.inner.unsubscribe_reply(channel).await;
        result
    }

    async fn register(&self, event: &str) -> Result<()> {
        self.inner.ensure_group(event).await?;
        self.inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.to_string());
        Ok(())
    }

    async fn after_subscribe(&self) -> Result<()> {
        self.inner.start_reading();
        Ok(())
    }

    async fn unregister(&self, event: &str) -> Result<()> {
        self.inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event);

        let Ok(mut conn) = self.inner.conn() else {
            // Membership is left for the stale-consumer sweep of another broker.
            debug!(stream = %event, "Disconnected, not leaving consumer group");
            return Ok(());
        };
        let (pending, removed): (i64, i64) = self
            .inner
            .leave_group
            .key(event)
            .arg(&self.inner.group)
            .arg(&self.inner.name)
            .arg(self.inner.options.stale_consumer_idle.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if pending < 0 {
            debug!(stream = %event, group = %self.inner.group, "No consumer group to leave");
        } else if pending > 0 {
            warn!(
                stream = %event,
                consumer = %self.inner.name,
                pending,
                "Consumer has pending entries, left in group"
            );
        } else {
            debug!(stream = %event, removed, "Left consumer group");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let task = self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.listening.store(false, Ordering::SeqCst);
        self.inner.core.correlations().clear();

        // Dropping the last handles closes the connections; the reply
        // listener exits once its command channel closes.
        self.inner
            .conn
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        info!(group = %self.inner.group, consumer = %self.inner.name, "Redis broker disconnected");
        Ok(())
    }
}

/// Acks an entry in its group; replies on the entry's reply channel.
struct RedisResponder {
    conn: ConnectionManager,
    stream: String,
    group: String,
    entry_id: String,
}

#[async_trait]
impl Responder for RedisResponder {
    async fn ack(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream, &self.group, &[&self.entry_id])
            .await?;
        Ok(())
    }

    async fn reply(&self, payload: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let channel = reply_channel(&self.stream, &self.entry_id);
        let _: i64 = conn.publish(&channel, &payload[..]).await?;
        Ok(())
    }
}
