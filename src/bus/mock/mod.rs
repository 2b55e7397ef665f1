//! Mock broker implementation for testing.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Broker, BrokerCore, BrokerError, Result, SendOptions};

/// Mock broker for testing.
///
/// Records what was published and called, answers every call with a canned
/// reply, and can be told to fail transport registration for chosen events.
#[derive(Default)]
pub struct MockBroker {
    core: BrokerCore,
    published: RwLock<Vec<(String, Value)>>,
    calls: RwLock<Vec<(String, Value)>>,
    call_reply: RwLock<Value>,
    registered: RwLock<HashSet<String>>,
    fail_register: RwLock<HashSet<String>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_register(&self, event: &str) {
        self.fail_register.write().await.insert(event.to_string());
    }

    pub async fn set_call_reply(&self, reply: Value) {
        *self.call_reply.write().await = reply;
    }

    pub async fn is_registered(&self, event: &str) -> bool {
        self.registered.read().await.contains(event)
    }

    pub async fn take_published(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn take_calls(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.calls.write().await)
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    async fn publish(&self, event: &str, data: &Value, _options: &SendOptions) -> Result<()> {
        self.published
            .write()
            .await
            .push((event.to_string(), data.clone()));
        Ok(())
    }

    async fn call(&self, method: &str, data: &Value, _options: &SendOptions) -> Result<Value> {
        self.calls
            .write()
            .await
            .push((method.to_string(), data.clone()));
        Ok(self.call_reply.read().await.clone())
    }

    async fn register(&self, event: &str) -> Result<()> {
        if self.fail_register.read().await.contains(event) {
            return Err(BrokerError::Subscribe(format!("Mock failure for {}", event)));
        }
        self.registered.write().await.insert(event.to_string());
        Ok(())
    }

    async fn unregister(&self, event: &str) -> Result<()> {
        self.registered.write().await.remove(event);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
