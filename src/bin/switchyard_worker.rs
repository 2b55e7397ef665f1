//! switchyard-worker: IPC echo worker
//!
//! Child process meant to be forked by an `IpcBroker`. Talks to its parent
//! over stdin/stdout and answers every message with its own payload. Once
//! subscribed it publishes `worker.ready` to the parent.
//!
//! ## Architecture
//! ```text
//! [parent IpcBroker] --(framed stdio)--> [switchyard-worker]
//!          ^                                     |
//!          +-------------- reply ----------------+
//! ```
//!
//! ## Configuration
//! - SWITCHYARD_WORKER_EVENTS: comma separated events to serve (default: echo)
//! - SWITCHYARD_LOG: log filter, written to stderr (default: info)

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use switchyard::bus::{IpcBroker, IpcChannel, IpcOptions};
use switchyard::config::WORKER_EVENTS_ENV_VAR;
use switchyard::utils::bootstrap::init_tracing;
use switchyard::{Broker, Message, SendOptions};

const DEFAULT_EVENTS: &str = "echo";
/// Published to the parent once every event is subscribed.
const READY_EVENT: &str = "worker.ready";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let events = std::env::var(WORKER_EVENTS_ENV_VAR).unwrap_or_else(|_| DEFAULT_EVENTS.to_string());
    let events: Vec<&str> = events
        .split(',')
        .map(str::trim)
        .filter(|event| !event.is_empty())
        .collect();

    let broker = IpcBroker::new(Some(IpcChannel::from_stdio()), IpcOptions::default());

    for event in &events {
        broker.core().on(event, |msg: Message| async move {
            msg.ack().await?;
            msg.reply(msg.data()).await
        });
    }
    broker.subscribe(&events).await?;
    broker
        .publish(
            READY_EVENT,
            &json!({ "pid": std::process::id(), "events": events }),
            &SendOptions::default(),
        )
        .await?;

    info!(pid = std::process::id(), events = ?events, "switchyard-worker started");

    let mut notices = broker.events();
    tokio::select! {
        _ = broker.parent_closed() => {}
        _ = async {
            loop {
                match notices.recv().await {
                    Ok(notice) => warn!(notice = ?notice, "Broker notice"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Broker notices dropped"),
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        } => {}
    }

    info!("Parent link closed, exiting");
    broker.disconnect().await?;
    Ok(())
}
