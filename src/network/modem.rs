//! Radio modem transport
//!
//! Drives a half-duplex AT-command modem over any byte stream (serial
//! port or serial-over-TCP bridge):
//! - Line framing of the modem's text protocol
//! - Command execution with status verification
//! - Forwarding of received frames to the engine

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, trace, warn};

use crate::protocol::{FRAME_PREFIX, MODEM_DELIMITER};

/// Status the modem answers to an accepted command
pub const STATUS_OK: &str = "AT,OK";
/// Status emitted when the modem starts transmitting a payload
pub const STATUS_SENDING: &str = "AT,SENDING";
/// Status emitted once the payload is on air
pub const STATUS_SENDED: &str = "AT,SENDED";

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("could not verify '{expected}', modem answered '{received}'")]
    Verification { expected: String, received: String },

    #[error("timed out waiting for '{expected}'")]
    Timeout { expected: String },

    #[error("modem connection closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Anything able to push a command to the radio and verify its answer
#[async_trait]
pub trait Radio: Send + Sync {
    /// Write `command` and wait for the modem to answer each of `expected`
    /// in order
    async fn execute(&self, command: &str, expected: &[&str]) -> TransportResult<()>;
}

/// Line codec of the modem's text protocol
#[derive(Debug, Clone)]
pub struct ModemCodec {
    max_line_length: usize,
    /// Index up to which the buffer is known to hold no newline
    next_index: usize,
    /// Dropping the remainder of an oversized line
    discarding: bool,
}

impl ModemCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Decoder for ModemCodec {
    type Item = String;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, TransportError> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if buf.len() > self.max_line_length {
                    if !self.discarding {
                        warn!(max = self.max_line_length, "Discarding oversized modem line");
                    }
                    buf.clear();
                    self.next_index = 0;
                    self.discarding = true;
                } else {
                    self.next_index = buf.len();
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let raw = buf.split_to(end + 1);

            // Tail of a line that already overflowed
            if std::mem::take(&mut self.discarding) {
                continue;
            }

            let mut line = &raw[..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }

            if line.len() > self.max_line_length {
                warn!(len = line.len(), "Discarding oversized modem line");
                continue;
            }

            match std::str::from_utf8(line) {
                Ok("") => continue,
                Ok(text) => return Ok(Some(text.to_string())),
                Err(_) => {
                    debug!(?line, "Dropping line that is not valid UTF-8");
                    continue;
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, TransportError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if !buf.is_empty() {
            debug!(len = buf.len(), "Dropping unterminated modem line");
            buf.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

impl Encoder<String> for ModemCodec {
    type Error = TransportError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), TransportError> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Modem transport settings
#[derive(Debug, Clone)]
pub struct ModemConfig {
    /// Time allowed for each expected status line
    pub verification_timeout: Duration,
    /// Capacity of the received frame queue
    pub inbound_queue: usize,
    /// Capacity of the command queue
    pub command_queue: usize,
    pub max_line_length: usize,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            verification_timeout: Duration::from_secs(25),
            inbound_queue: 1000,
            command_queue: 100,
            max_line_length: 512,
        }
    }
}

/// Open the modem's serial port in non-blocking mode.
///
/// Reads and writes are polled independently, so a command can be written
/// while the idle read is still waiting for the radio.
pub fn open_serial(path: &str, baud_rate: u32) -> TransportResult<SerialStream> {
    info!(path, baud_rate, "Opening serial port");
    Ok(tokio_serial::new(path, baud_rate).open_native_async()?)
}

/// A command waiting for the modem
#[derive(Debug)]
pub struct ModemCommand {
    pub command: String,
    pub expected: Vec<String>,
    pub reply: oneshot::Sender<TransportResult<()>>,
}

/// Cloneable handle for submitting commands to a running [`Modem`]
#[derive(Clone, Debug)]
pub struct ModemHandle {
    sender: mpsc::Sender<ModemCommand>,
}

impl ModemHandle {
    pub fn new(sender: mpsc::Sender<ModemCommand>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Radio for ModemHandle {
    async fn execute(&self, command: &str, expected: &[&str]) -> TransportResult<()> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(ModemCommand {
                command: command.to_string(),
                expected: expected.iter().map(|s| s.to_string()).collect(),
                reply,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        response.await.map_err(|_| TransportError::Closed)?
    }
}

/// Task owning the modem stream.
///
/// Only one command is in flight at a time; received frames keep flowing to
/// the inbound queue while a command is being verified.
pub struct Modem<S> {
    framed: Framed<S, ModemCodec>,
    commands: mpsc::Receiver<ModemCommand>,
    inbound: mpsc::Sender<String>,
    verification_timeout: Duration,
}

impl<S> Modem<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `stream`, returning the task, its command handle and the queue
    /// of received frames
    pub fn new(stream: S, config: &ModemConfig) -> (Self, ModemHandle, mpsc::Receiver<String>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_queue);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);

        let modem = Self {
            framed: Framed::new(stream, ModemCodec::new(config.max_line_length)),
            commands: command_rx,
            inbound: inbound_tx,
            verification_timeout: config.verification_timeout,
        };

        (modem, ModemHandle::new(command_tx), inbound_rx)
    }

    /// Run until the stream closes or every handle and the inbound receiver
    /// are dropped
    pub async fn run(mut self) -> TransportResult<()> {
        info!("Modem transport started");

        loop {
            tokio::select! {
                line = self.framed.next() => {
                    match line {
                        Some(Ok(line)) => {
                            if !self.forward_line(line).await {
                                break;
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            info!("Modem stream closed");
                            return Err(TransportError::Closed);
                        }
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All modem handles dropped");
                        break;
                    };
                    let result = self.execute(&command.command, &command.expected).await;
                    if let Err(e) = &result {
                        warn!(command = %command.command, "Modem command failed: {}", e);
                    }
                    let closed = matches!(
                        result,
                        Err(TransportError::Closed | TransportError::Io(_) | TransportError::Serial(_))
                    );
                    let _ = command.reply.send(result);
                    if closed {
                        return Err(TransportError::Closed);
                    }
                }
            }
        }

        info!("Modem transport stopped");
        Ok(())
    }

    /// Hand a received frame to the engine; returns false once nobody listens
    async fn forward_line(&mut self, line: String) -> bool {
        if !is_frame(&line) {
            debug!(%line, "Ignoring modem output");
            return true;
        }
        trace!(%line, "Received frame");
        self.inbound.send(line).await.is_ok()
    }

    async fn execute(&mut self, command: &str, expected: &[String]) -> TransportResult<()> {
        debug!(%command, "Sending command");
        let deadline = tokio::time::Instant::now() + self.verification_timeout;
        tokio::time::timeout_at(deadline, self.framed.send(command.to_string()))
            .await
            .map_err(|_| TransportError::Timeout {
                expected: format!("write of '{}'", command),
            })??;

        for token in expected {
            let status = self.next_status(token).await?;
            if status != *token {
                return Err(TransportError::Verification {
                    expected: token.clone(),
                    received: status,
                });
            }
            trace!(%status, "Verified status");
        }

        Ok(())
    }

    /// Next non-frame line, forwarding frames that arrive in between
    async fn next_status(&mut self, expected: &str) -> TransportResult<String> {
        let deadline = tokio::time::Instant::now() + self.verification_timeout;

        loop {
            let line = tokio::time::timeout_at(deadline, self.framed.next())
                .await
                .map_err(|_| TransportError::Timeout {
                    expected: expected.to_string(),
                })?
                .ok_or(TransportError::Closed)??;

            if is_frame(&line) {
                debug!(%line, "Frame received while verifying command");
                if self.inbound.send(line).await.is_err() {
                    return Err(TransportError::Closed);
                }
                continue;
            }

            return Ok(line.trim().to_string());
        }
    }
}

fn is_frame(line: &str) -> bool {
    line.split(MODEM_DELIMITER).next() == Some(FRAME_PREFIX)
}
