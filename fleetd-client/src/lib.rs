//! Fleet device client
//!
//! Speaks the device side of the command channel: hello, poll for the next
//! pending command and acknowledge it. Used by the probe binary and by the
//! daemon's integration tests.

use std::time::Duration;

use fleet_common::protocol::{CommandPush, Envelope, HelloAck, MsgType, ProtocolError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::debug;

pub const DEFAULT_ADDR: &str = "127.0.0.1:2233";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("disconnected")]
    Disconnected,
    #[error("timeout")]
    Timeout,
    #[error("unexpected msgType {0}")]
    UnexpectedFrame(i64),
}

pub struct DeviceClient {
    device: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    // Kept across reads: a timed-out read may leave a partial line here.
    pending: String,
}

impl DeviceClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A, device: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            device: device.to_string(),
            reader: BufReader::new(reader),
            writer,
            pending: String::new(),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub async fn hello(&mut self, wait: Duration) -> Result<HelloAck, ClientError> {
        self.send(&Envelope::hello()).await?;
        let reply = self.next_envelope(wait).await?.ok_or(ClientError::Timeout)?;
        Ok(HelloAck::from_envelope(&reply)?)
    }

    /// Poll once. `None` when no command arrives within `wait`, which is
    /// how the daemon answers a poll with nothing pending.
    pub async fn poll(&mut self, wait: Duration) -> Result<Option<CommandPush>, ClientError> {
        self.send(&Envelope::poll(&self.device)).await?;
        match self.next_envelope(wait).await? {
            None => Ok(None),
            Some(reply) if reply.kind() == MsgType::CommandPush => {
                Ok(Some(CommandPush::from_envelope(&reply)?))
            }
            Some(reply) => Err(ClientError::UnexpectedFrame(reply.msg_type)),
        }
    }

    pub async fn ack(&mut self, command_uuid: &str) -> Result<(), ClientError> {
        self.send(&Envelope::command_ack(command_uuid)).await
    }

    /// Write `line` as-is, adding the newline if missing.
    pub async fn send_raw(&mut self, line: &str) -> Result<(), ClientError> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Next frame from the daemon, or `None` if none arrives within `wait`.
    pub async fn next_envelope(&mut self, wait: Duration) -> Result<Option<Envelope>, ClientError> {
        loop {
            let read = match timeout(wait, self.reader.read_line(&mut self.pending)).await {
                Ok(read) => read?,
                Err(_) => return Ok(None),
            };
            if read == 0 {
                return Err(ClientError::Disconnected);
            }
            if !self.pending.ends_with('\n') {
                continue;
            }

            let line = std::mem::take(&mut self.pending);
            if line.trim().is_empty() {
                continue;
            }
            debug!(device = %self.device, frame = %line.trim(), "received");
            return Ok(Some(Envelope::decode(&line)?));
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let line = envelope.encode_line()?;
        self.send_raw(&line).await
    }
}
