//! Switchyard - transport-agnostic message brokers
//!
//! Publish/subscribe fan-out and correlation-based request/response over
//! three transports: AMQP exchanges and queues, Redis stream consumer groups,
//! and parent/child process message passing.

pub mod bus;
pub mod config;
pub mod proxy;
pub mod utils;

pub use bus::{
    Broker, BrokerCore, BrokerError, BrokerEvent, Codec, Message, MessageHandler, Result,
    SendOptions,
};
