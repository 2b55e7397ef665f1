//! REST proxy client.
//!
//! Serializes HTTP-shaped requests onto a broker's RPC channel. A proxy
//! service subscribed to `REQUEST` performs the HTTP call and replies with the
//! raw response payload.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::bus::{Broker, BrokerError, Result, SendOptions};

/// RPC method every proxied request is sent to.
pub const REQUEST_METHOD: &str = "REQUEST";

/// HTTP method of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Per-request extras.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Headers added after (and overriding) the defaults.
    pub headers: BTreeMap<String, String>,
    pub query: Option<BTreeMap<String, String>>,
    pub send: SendOptions,
}

/// What crosses the broker for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// REST client whose transport is a broker `call`.
#[derive(Clone)]
pub struct RestClient {
    broker: Arc<dyn Broker>,
    token: String,
}

impl RestClient {
    pub fn new(broker: Arc<dyn Broker>, token: impl Into<String>) -> Self {
        Self {
            broker,
            token: token.into(),
        }
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<Value> {
        self.make(Method::Get, path, None, options).await
    }

    pub async fn post(&self, path: &str, body: Value, options: RequestOptions) -> Result<Value> {
        self.make(Method::Post, path, Some(body), options).await
    }

    pub async fn put(&self, path: &str, body: Value, options: RequestOptions) -> Result<Value> {
        self.make(Method::Put, path, Some(body), options).await
    }

    pub async fn patch(&self, path: &str, body: Value, options: RequestOptions) -> Result<Value> {
        self.make(Method::Patch, path, Some(body), options).await
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<Value> {
        self.make(Method::Delete, path, None, options).await
    }

    /// Build the descriptor for a request without sending it.
    pub fn describe(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> RequestDescriptor {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Bot {}", self.token));
        headers.insert(
            "X-RateLimit-Precision".to_string(),
            "millisecond".to_string(),
        );
        headers.extend(options.headers.clone());

        let body = body.filter(|body| !body.is_null());
        if body.is_some() {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }

        RequestDescriptor {
            method,
            path: path.to_string(),
            query: options.query.clone(),
            headers: Some(headers),
            body,
        }
    }

    async fn make(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let descriptor = self.describe(method, path, body, &options);
        let data = serde_json::to_value(&descriptor)
            .map_err(|e| BrokerError::Codec(format!("request descriptor: {}", e)))?;

        debug!(method = ?method, path = %path, "Proxying request");
        self.broker.call(REQUEST_METHOD, &data, &options.send).await
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}
