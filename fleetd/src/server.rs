//! Device command channel.
//!
//! Devices keep a TCP session open and exchange newline-delimited frames.
//! Each session is a two-state machine: `Idle` until the first poll names
//! the device, `Identified` afterwards. A poll pops at most one pending
//! command for the named device. Malformed or unknown frames are logged and
//! dropped; they never close the session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use fleet_common::now_ts;
use fleet_common::protocol::{format_msg_date, Envelope, Inbound, MAX_FRAME_BYTES};
use fleet_common::tasks::TaskStore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Identified {
        device: String,
    },
}

impl SessionState {
    pub fn device(&self) -> Option<&str> {
        match self {
            SessionState::Idle => None,
            SessionState::Identified { device } => Some(device),
        }
    }
}

enum Frame {
    Line(String),
    Oversized,
    NotUtf8,
    Eof,
}

pub struct CommandChannelServer {
    tasks: Arc<TaskStore>,
    idle_timeout: Option<Duration>,
}

impl CommandChannelServer {
    pub fn new(tasks: Arc<TaskStore>, idle_timeout: Option<Duration>) -> Self {
        Self {
            tasks,
            idle_timeout,
        }
    }

    /// Apply one inbound frame to the session and return the reply, if any.
    pub fn handle_frame(
        &self,
        state: &mut SessionState,
        line: &str,
        now: f64,
        msg_date: &str,
    ) -> Option<Envelope> {
        let inbound = match Inbound::parse(line) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(device = ?state.device(), "discarding frame: {}", err);
                return None;
            }
        };

        match inbound {
            Inbound::Hello => {
                debug!(device = ?state.device(), "hello");
                Some(Envelope::hello_ack())
            }
            Inbound::Poll { device } => {
                if state.device() != Some(device.as_str()) {
                    info!(device = %device, "session identified");
                    *state = SessionState::Identified {
                        device: device.clone(),
                    };
                }
                match self.tasks.pop_next_pending(&device, now) {
                    Some(command) => {
                        info!(
                            device = %device,
                            command = %command.command_uuid,
                            template = %command.template,
                            "pushing command"
                        );
                        Some(Envelope::command_push(&device, &command, msg_date))
                    }
                    None => {
                        debug!(device = %device, "no pending task");
                        None
                    }
                }
            }
            Inbound::CommandAck { command_uuid } => {
                info!(device = ?state.device(), command = ?command_uuid, "command acknowledged");
                None
            }
            Inbound::Other(code) => {
                warn!(device = ?state.device(), msg_type = code, "unsupported msgType, ignoring");
                None
            }
        }
    }

    /// Accept sessions until shutdown, then wait for open sessions to close.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("command channel listening on {}", addr);
        }
        let mut sessions = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let session_shutdown = shutdown.clone();
                        sessions.spawn(async move {
                            let peer = peer.to_string();
                            info!(%peer, "device connected");
                            match server.handle_connection(stream, &peer, session_shutdown).await {
                                Ok(()) => info!(%peer, "device disconnected"),
                                Err(err) => warn!(%peer, "session ended with error: {:#}", err),
                            }
                        });
                    }
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        info!(open_sessions = sessions.len(), "command channel stopping");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }

    /// Run one session until EOF, idle timeout or shutdown.
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        peer: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut state = SessionState::default();

        while !*shutdown.borrow() {
            let next = async {
                match self.idle_timeout {
                    Some(limit) => timeout(limit, read_frame(&mut reader, &mut buf)).await.ok(),
                    None => Some(read_frame(&mut reader, &mut buf).await),
                }
            };

            let frame = tokio::select! {
                _ = shutdown.changed() => {
                    debug!(%peer, "closing session on shutdown");
                    break;
                }
                frame = next => frame,
            };

            let line = match frame {
                None => {
                    info!(%peer, device = ?state.device(), "session idle, closing");
                    break;
                }
                Some(read) => match read? {
                    Frame::Eof => break,
                    Frame::Oversized => {
                        warn!(%peer, "discarding frame over {} bytes", MAX_FRAME_BYTES);
                        continue;
                    }
                    Frame::NotUtf8 => {
                        warn!(%peer, "discarding frame that is not UTF-8");
                        continue;
                    }
                    Frame::Line(line) => line,
                },
            };
            if line.is_empty() {
                continue;
            }
            debug!(%peer, frame = %line, "received");

            let msg_date = format_msg_date(&Local::now());
            if let Some(reply) = self.handle_frame(&mut state, &line, now_ts(), &msg_date) {
                writer.write_all(reply.encode_line()?.as_bytes()).await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }
}

async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_FRAME_BYTES as u64 + 1;
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(Frame::Eof);
    }

    if buf.last() != Some(&b'\n') && buf.len() > MAX_FRAME_BYTES {
        // Drain the rest of the oversized line so the next frame starts clean.
        loop {
            buf.clear();
            let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
            if read == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        return Ok(Frame::Oversized);
    }

    match std::str::from_utf8(buf) {
        Ok(text) => Ok(Frame::Line(text.trim().to_string())),
        Err(_) => Ok(Frame::NotUtf8),
    }
}
