//! IPC links.
//!
//! An `IpcChannel` is one end of a bidirectional message link. In-memory
//! pairs link brokers inside one process; byte streams (stdio, child pipes)
//! carry length-prefixed frames: 4-byte big-endian length, then the
//! MessagePack-encoded `IpcMessage`.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{IpcMessage, CHANNEL_CAPACITY, MAX_FRAME_LEN};
use crate::bus::{BrokerError, Result};

/// Where a sender's messages go.
#[derive(Debug, Clone)]
enum Outbound {
    /// Straight into the peer's inbound queue.
    Memory(mpsc::Sender<Result<IpcMessage>>),
    /// Encoded frames for the writer task.
    Stream(mpsc::Sender<Vec<u8>>),
}

/// Sending half of a link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IpcSender {
    outbound: Outbound,
}

impl IpcSender {
    /// Queue a message on the link. Resolves once the link accepted it.
    ///
    /// On byte-stream links the frame is encoded here, so an oversized or
    /// unencodable message fails the caller instead of the writer.
    pub async fn send(&self, message: IpcMessage) -> Result<()> {
        let sent = match &self.outbound {
            Outbound::Memory(tx) => tx.send(Ok(message)).await.is_ok(),
            Outbound::Stream(tx) => tx.send(encode_frame(&message)?).await.is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(BrokerError::Connection("IPC link closed".to_string()))
        }
    }
}

/// What a link yields: a message, or a frame that failed to decode.
pub(crate) type Inbound = mpsc::Receiver<Result<IpcMessage>>;

/// One end of a bidirectional IPC link.
#[derive(Debug)]
pub struct IpcChannel {
    sender: IpcSender,
    receiver: Inbound,
    child: Option<Child>,
}

impl IpcChannel {
    /// Two linked in-memory ends.
    pub fn pair() -> (IpcChannel, IpcChannel) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let a = IpcChannel {
            sender: IpcSender {
                outbound: Outbound::Memory(b_tx),
            },
            receiver: a_rx,
            child: None,
        };
        let b = IpcChannel {
            sender: IpcSender {
                outbound: Outbound::Memory(a_tx),
            },
            receiver: b_rx,
            child: None,
        };
        (a, b)
    }

    /// Link over this process's stdin/stdout (the child side of a fork).
    ///
    /// Anything else written to stdout corrupts the link; log to stderr.
    pub fn from_stdio() -> IpcChannel {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Link over an arbitrary byte stream pair.
    ///
    /// Spawns a reader and a writer task; must be called inside a tokio runtime.
    pub fn from_io<R, W>(reader: R, writer: W) -> IpcChannel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(read_frames(reader, inbound_tx));
        tokio::spawn(write_frames(writer, outbound_rx));

        IpcChannel {
            sender: IpcSender {
                outbound: Outbound::Stream(outbound_tx),
            },
            receiver: inbound_rx,
            child: None,
        }
    }

    /// Spawn `command` as a child process linked over its stdin/stdout.
    ///
    /// The child is killed when the returned channel (or the broker that
    /// adopted it) is dropped.
    pub fn spawn(mut command: Command) -> Result<IpcChannel> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Connection("child stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Connection("child stdout not piped".to_string()))?;

        info!(pid = ?child.id(), "Spawned IPC child");

        let mut channel = Self::from_io(stdout, stdin);
        channel.child = Some(child);
        Ok(channel)
    }

    pub fn sender(&self) -> IpcSender {
        self.sender.clone()
    }

    pub(crate) fn into_parts(self) -> (IpcSender, Inbound, Option<Child>) {
        (self.sender, self.receiver, self.child)
    }
}

/// Encode a message as one length-prefixed frame.
pub fn encode_frame(message: &IpcMessage) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(message)
        .map_err(|e| BrokerError::Codec(format!("IPC frame encode: {}", e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(BrokerError::Publish(format!(
            "IPC frame of {} bytes exceeds {} byte limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame body. `Ok(None)` on a clean end of stream.
///
/// A length prefix over [`MAX_FRAME_LEN`] is an error: the stream cannot be
/// resynchronized after it.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BrokerError::MalformedEnvelope(format!(
            "IPC frame of {} bytes exceeds {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Decode a frame body into a message.
pub fn decode_frame(body: &[u8]) -> Result<IpcMessage> {
    rmp_serde::from_slice(body)
        .map_err(|e| BrokerError::MalformedEnvelope(format!("IPC frame decode: {}", e)))
}

async fn read_frames<R: AsyncRead + Unpin>(
    mut reader: R,
    inbound: mpsc::Sender<Result<IpcMessage>>,
) {
    loop {
        let body = match read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("IPC stream closed");
                return;
            }
            Err(e) => {
                error!(error = %e, "IPC link unreadable, closing");
                let _ = inbound.send(Err(e)).await;
                return;
            }
        };

        // The frame boundary is intact, so a bad body only costs this message.
        let message = decode_frame(&body);
        if let Err(e) = &message {
            warn!(error = %e, len = body.len(), "Skipping undecodable IPC frame");
        }
        if inbound.send(message).await.is_err() {
            debug!("IPC receiver dropped, stopping reader");
            return;
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(mut writer: W, mut outbound: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await
        {
            error!(error = %e, "IPC write error, closing link");
            return;
        }
    }
}
