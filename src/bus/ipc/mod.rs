//! IPC broker for parent/child worker processes.
//!
//! Substitutes for AMQP/Redis when workers are forked from one parent and
//! talk over their stdio pipes.
//!
//! Topology:
//! ```text
//!              ┌─────────────┐
//!              │   Parent    │
//!              │ (IpcBroker) │
//!              └─────────────┘
//!        round-robin │ publish/call
//!          ┌─────────┼─────────┐
//!          ▼         ▼         ▼
//!     ┌─────────┐┌─────────┐┌─────────┐
//!     │ child-0 ││ child-1 ││ child-2 │
//!     └─────────┘└─────────┘└─────────┘
//! ```
//!
//! Replies travel back over the link the request arrived on.
//!
//! Usage:
//! 1. Parent creates `IpcBroker::new(None, ..)` and calls `fork` (or `adopt`)
//! 2. Each child creates `IpcBroker::new(Some(IpcChannel::from_stdio()), ..)`
//! 3. Children subscribe and register handlers; the parent publishes and calls

mod broker;
mod channel;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use broker::{IpcBroker, IpcOptions};
pub use channel::{IpcChannel, IpcSender};

/// Largest frame accepted on a link.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Buffered messages per link direction.
pub const CHANNEL_CAPACITY: usize = 1024;

/// The envelope as carried over an IPC link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Event (or method) name.
    pub event: String,
    /// Codec-encoded payload.
    pub data: Bytes,
    /// Correlation key of a call or of its reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Set on replies so a late reply is never mistaken for a request.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reply: bool,
}

impl IpcMessage {
    pub fn event(event: impl Into<String>, data: Bytes) -> Self {
        Self {
            event: event.into(),
            data,
            key: None,
            reply: false,
        }
    }

    pub fn request(event: impl Into<String>, data: Bytes, key: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data,
            key: Some(key.into()),
            reply: false,
        }
    }

    pub fn reply(event: impl Into<String>, data: Bytes, key: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data,
            key: Some(key.into()),
            reply: true,
        }
    }
}
