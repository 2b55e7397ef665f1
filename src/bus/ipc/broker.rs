//! IPC broker - same interface as AMQP/Redis.
//!
//! Publishes go to the next child in round-robin order, or to the parent when
//! no children are attached. Every link is listened on; what arrives is
//! dispatched through the broker core with a responder bound to that link.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::channel::{Inbound, IpcChannel, IpcSender};
use super::IpcMessage;
use crate::bus::codec::{Codec, MsgPackCodec};
use crate::bus::{
    Broker, BrokerCore, BrokerError, Envelope, Responder, Result, SendOptions,
};

/// Configuration for the IPC broker.
#[derive(Debug, Clone)]
pub struct IpcOptions {
    /// Payload codec.
    pub codec: Arc<dyn Codec>,
}

impl Default for IpcOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(MsgPackCodec),
        }
    }
}

struct ChildLink {
    sender: IpcSender,
    /// Held so `kill_on_drop` fires when the link goes away.
    _process: Option<Child>,
}

#[derive(Default)]
struct Children {
    links: Vec<ChildLink>,
    next: usize,
}

struct IpcInner {
    core: BrokerCore,
    parent: Option<IpcSender>,
    children: Mutex<Children>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    parent_closed: watch::Sender<bool>,
}

impl IpcInner {
    fn children(&self) -> MutexGuard<'_, Children> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next child in round-robin order, else the parent.
    fn next_route(&self) -> Option<IpcSender> {
        let mut children = self.children();
        if children.links.is_empty() {
            return self.parent.clone();
        }
        if children.next >= children.links.len() {
            children.next = 0;
        }
        let sender = children.links[children.next].sender.clone();
        children.next += 1;
        Some(sender)
    }

    /// Dispatch a request or event that arrived on `link`.
    async fn handle(&self, message: IpcMessage, link: IpcSender) {
        if !self.core.is_subscribed(&message.event) {
            debug!(event = %message.event, "Not subscribed, dropping IPC message");
            return;
        }

        let responder = Arc::new(IpcResponder {
            link,
            event: message.event.clone(),
            key: message.key.clone(),
        });
        let envelope = Envelope {
            event: message.event,
            payload: message.data,
            correlation_id: message.key,
        };

        self.core.dispatch(envelope, responder).await;
    }
}

/// Listen on one link until it closes.
///
/// Replies are resolved by the listener itself; everything else is handed to
/// one dispatcher per link, which runs handlers in arrival order. A handler
/// may therefore `call` over the link it is serving: its reply never waits
/// behind it.
fn listen(
    inner: Weak<IpcInner>,
    mut receiver: Inbound,
    link: IpcSender,
    is_parent: bool,
) -> [JoinHandle<()>; 2] {
    let (queue, mut queued) = mpsc::unbounded_channel::<IpcMessage>();

    let dispatcher = {
        let inner = inner.clone();
        tokio::spawn(async move {
            while let Some(message) = queued.recv().await {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.handle(message, link.clone()).await;
            }
        })
    };

    let listener = tokio::spawn(async move {
        while let Some(item) = receiver.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match item {
                Ok(message) if message.reply => {
                    if let Some(key) = message.key.as_deref() {
                        inner.core.resolve_reply(key, message.data);
                    }
                }
                Ok(message) => {
                    if queue.send(message).is_err() {
                        return;
                    }
                }
                Err(e) => inner.core.emit_error(e),
            }
        }

        debug!(is_parent, "IPC link closed");
        if is_parent {
            if let Some(inner) = inner.upgrade() {
                let _ = inner.parent_closed.send(true);
            }
        }
    });

    [listener, dispatcher]
}

/// IPC broker over parent/child links.
#[derive(Clone)]
pub struct IpcBroker {
    inner: Arc<IpcInner>,
}

impl IpcBroker {
    /// Create a broker. `parent` is this process's link to its parent, if any.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(parent: Option<IpcChannel>, options: IpcOptions) -> Self {
        let (parent_closed, _) = watch::channel(false);

        let (parent_sender, parent_parts) = match parent {
            Some(channel) => {
                let (sender, receiver, _) = channel.into_parts();
                (Some(sender.clone()), Some((sender, receiver)))
            }
            None => (None, None),
        };

        let inner = Arc::new(IpcInner {
            core: BrokerCore::new(options.codec),
            parent: parent_sender,
            children: Mutex::new(Children::default()),
            tasks: Mutex::new(Vec::new()),
            parent_closed,
        });

        if let Some((sender, receiver)) = parent_parts {
            let tasks = listen(Arc::downgrade(&inner), receiver, sender, true);
            inner.tasks().extend(tasks);
        }

        Self { inner }
    }

    /// Attach a child link.
    pub fn adopt(&self, channel: IpcChannel) {
        let (sender, receiver, process) = channel.into_parts();

        let tasks = listen(Arc::downgrade(&self.inner), receiver, sender.clone(), false);
        self.inner.tasks().extend(tasks);

        let count = {
            let mut children = self.inner.children();
            children.links.push(ChildLink {
                sender,
                _process: process,
            });
            children.links.len()
        };

        info!(children = count, "Attached IPC child");
    }

    /// Spawn `command` as a worker process and attach it as a child.
    pub fn fork(&self, command: Command) -> Result<()> {
        let channel = IpcChannel::spawn(command)?;
        self.adopt(channel);
        Ok(())
    }

    pub fn children(&self) -> usize {
        self.inner.children().links.len()
    }

    pub fn has_parent(&self) -> bool {
        self.inner.parent.is_some()
    }

    /// Resolves once the parent link has closed. Never resolves without a parent.
    pub async fn parent_closed(&self) {
        let mut closed = self.inner.parent_closed.subscribe();
        // Err means the sender is gone, which only happens with the broker itself.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn send(&self, message: IpcMessage) -> Result<()> {
        let route = self.inner.next_route().ok_or(BrokerError::NoRoute)?;
        route.send(message).await
    }
}

#[async_trait]
impl Broker for IpcBroker {
    fn core(&self) -> &BrokerCore {
        &self.inner.core
    }

    async fn publish(&self, event: &str, data: &Value, _options: &SendOptions) -> Result<()> {
        let payload = self.inner.core.encode(data)?;
        self.send(IpcMessage::event(event, payload)).await
    }

    async fn call(&self, method: &str, data: &Value, options: &SendOptions) -> Result<Value> {
        let payload = self.inner.core.encode(data)?;
        let key = Uuid::new_v4().to_string();
        let pending = self.inner.core.correlations().register(key.clone())?;

        self.send(IpcMessage::request(method, payload, key)).await?;

        self.inner.core.await_reply(pending, options).await
    }

    /// Delivery is local; nothing to register.
    async fn register(&self, _event: &str) -> Result<()> {
        Ok(())
    }

    async fn unregister(&self, _event: &str) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for task in self.inner.tasks().drain(..) {
            task.abort();
        }
        let dropped = std::mem::take(&mut self.inner.children().links);
        self.inner.core.correlations().clear();
        info!(children = dropped.len(), "IPC broker disconnected");
        Ok(())
    }
}

/// Replies go back over the link the message arrived on.
struct IpcResponder {
    link: IpcSender,
    event: String,
    key: Option<String>,
}

#[async_trait]
impl Responder for IpcResponder {
    /// IPC links have no redelivery, so there is nothing to acknowledge.
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn reply(&self, payload: Bytes) -> Result<()> {
        match &self.key {
            Some(key) => {
                self.link
                    .send(IpcMessage::reply(&self.event, payload, key))
                    .await
            }
            None => {
                debug!(event = %self.event, "Reply to a publish has no caller, dropping");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Message;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_without_route_fails() {
        let broker = IpcBroker::new(None, IpcOptions::default());
        let err = broker
            .publish("ping", &json!("x"), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transport_unavailable());
    }

    #[tokio::test]
    async fn test_round_robin_wraps() {
        let parent = IpcBroker::new(None, IpcOptions::default());
        let mut far_ends = Vec::new();
        for _ in 0..2 {
            let (near, far) = IpcChannel::pair();
            parent.adopt(near);
            far_ends.push(far.into_parts().1);
        }

        for i in 0..3 {
            parent
                .publish("work", &json!(i), &SendOptions::default())
                .await
                .unwrap();
        }

        let codec = MsgPackCodec;
        let first: Vec<Value> = {
            let rx = &mut far_ends[0];
            vec![
                codec.decode(&rx.recv().await.unwrap().unwrap().data).unwrap(),
                codec.decode(&rx.recv().await.unwrap().unwrap().data).unwrap(),
            ]
        };
        let second = codec
            .decode(&far_ends[1].recv().await.unwrap().unwrap().data)
            .unwrap();

        assert_eq!(first, vec![json!(0), json!(2)]);
        assert_eq!(second, json!(1));
    }

    #[tokio::test]
    async fn test_child_publishes_to_parent() {
        let (to_child, to_parent) = IpcChannel::pair();
        let child = IpcBroker::new(Some(to_parent), IpcOptions::default());
        let (_tx, mut rx, _) = to_child.into_parts();

        child
            .publish("status", &json!({"ready": true}), &SendOptions::default())
            .await
            .unwrap();

        let received = rx.recv().await.unwrap().unwrap();
        assert_eq!(received.event, "status");
        assert!(received.key.is_none());
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (to_child, to_parent) = IpcChannel::pair();
        let parent = IpcBroker::new(None, IpcOptions::default());
        parent.adopt(to_child);
        let child = IpcBroker::new(Some(to_parent), IpcOptions::default());

        child.core().on("greet", |msg: Message| async move {
            msg.ack().await?;
            msg.reply(&json!("hello")).await
        });
        child.subscribe(&["greet"]).await.unwrap();

        let reply = parent
            .call("greet", &json!("hi"), &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(reply, json!("hello"));
        assert!(parent.core().correlations().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribed_events_are_dropped() {
        let (to_child, to_parent) = IpcChannel::pair();
        let parent = IpcBroker::new(None, IpcOptions::default());
        parent.adopt(to_child);
        let child = IpcBroker::new(Some(to_parent), IpcOptions::default());
        child.core().on("greet", |msg: Message| async move {
            msg.reply(&json!("hello")).await
        });

        let err = parent
            .call(
                "greet",
                &json!("hi"),
                &SendOptions::with_expiration(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(parent.core().correlations().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_reported_and_link_kept() {
        use super::super::channel::encode_frame;
        use crate::bus::BrokerEvent;
        use tokio::io::AsyncWriteExt;

        let (mut parent_end, child_end) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(child_end);
        let child = IpcBroker::new(Some(IpcChannel::from_io(read, write)), IpcOptions::default());
        let mut events = child.events();

        let (tx, mut rx) = mpsc::channel(4);
        child.core().on("work", move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.data().clone()).await;
                Ok(())
            }
        });
        child.subscribe(&["work"]).await.unwrap();

        let payload = MsgPackCodec.encode(&json!(7)).unwrap();
        let valid = encode_frame(&IpcMessage::event("work", payload)).unwrap();
        parent_end.write_all(&[0, 0, 0, 3, 0xc1, 0xc1, 0xc1]).await.unwrap();
        parent_end.write_all(&valid).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            notice,
            BrokerEvent::Error(e) if matches!(*e, BrokerError::MalformedEnvelope(_))
        ));

        let data = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, json!(7));
        assert!(!*child.inner.parent_closed.borrow());
    }

    #[tokio::test]
    async fn test_oversized_publish_fails() {
        let (near, _far) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(near);
        let parent = IpcBroker::new(None, IpcOptions::default());
        parent.adopt(IpcChannel::from_io(read, write));

        let big = "x".repeat(super::super::MAX_FRAME_LEN + 1);
        let err = parent
            .publish("big", &json!(big), &SendOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Publish(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_link_delivers_in_order() {
        let (to_child, to_parent) = IpcChannel::pair();
        let parent = IpcBroker::new(None, IpcOptions::default());
        parent.adopt(to_child);
        let child = IpcBroker::new(Some(to_parent), IpcOptions::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        child.core().on("seq", move |msg: Message| {
            let tx = tx.clone();
            async move {
                let n = msg.decode::<u64>()?;
                tokio::task::yield_now().await;
                let _ = tx.send(n);
                Ok(())
            }
        });
        child.subscribe(&["seq"]).await.unwrap();

        for n in 0..2000u64 {
            parent
                .publish("seq", &json!(n), &SendOptions::default())
                .await
                .unwrap();
        }

        let mut seen = Vec::with_capacity(2000);
        while seen.len() < 2000 {
            let n = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(n);
        }
        assert_eq!(seen, (0..2000u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_parent_closed_resolves() {
        let (to_child, to_parent) = IpcChannel::pair();
        let child = IpcBroker::new(Some(to_parent), IpcOptions::default());
        drop(to_child);

        tokio::time::timeout(Duration::from_secs(1), child.parent_closed())
            .await
            .unwrap();
    }
}
