//! Transport session to the coordinator.
//!
//! One TCP stream carrying JSON message objects. Outbound frames are one
//! object per line; inbound objects may be newline separated or written
//! back to back, and may be split across reads.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use taskfleet_core::Message;

use crate::error::WorkerError;

/// Receive buffer requested before connecting.
pub const RECV_BUFFER_SIZE: u32 = 1024 * 1024;

/// How often to log while waiting on the coordinator.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 64 * 1024;

/// Incomplete input beyond this size is dropped.
const MAX_BUFFERED: usize = 16 * 1024 * 1024;

/// Messages read in one [`Connection::receive`] call.
#[derive(Debug, Default)]
pub struct Inbound {
    pub messages: Vec<Message>,
    /// The coordinator closed its side.
    pub eof: bool,
}

/// Splits a byte stream into messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

enum Stop {
    Exhausted,
    Incomplete,
    Malformed(serde_json::Error),
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a message.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Parse every complete message in the buffer, keeping the remainder.
    ///
    /// Objects that are valid JSON but not a valid message are dropped on
    /// their own. Bytes that are not JSON at all are dropped up to the next
    /// newline.
    pub fn decode(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();

        loop {
            let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let mut consumed = 0;
            let stop = loop {
                match values.next() {
                    Some(Ok(value)) => {
                        consumed = values.byte_offset();
                        match serde_json::from_value::<Message>(value) {
                            Ok(message) => messages.push(message),
                            Err(e) => warn!(error = %e, "Discarding invalid message"),
                        }
                    }
                    Some(Err(e)) if e.is_eof() => break Stop::Incomplete,
                    Some(Err(e)) => break Stop::Malformed(e),
                    None => break Stop::Exhausted,
                }
            };
            drop(values);

            match stop {
                Stop::Exhausted => {
                    self.buf.clear();
                    return messages;
                }
                Stop::Incomplete => {
                    self.buf.drain(..consumed);
                    if self.buf.len() > MAX_BUFFERED {
                        warn!(bytes = self.buf.len(), "Dropping oversized partial message");
                        self.buf.clear();
                    }
                    return messages;
                }
                Stop::Malformed(e) => {
                    let rest = &self.buf[consumed..];
                    let preview: String = String::from_utf8_lossy(rest).chars().take(100).collect();
                    warn!(error = %e, preview = %preview, "Discarding malformed input");
                    match rest.iter().position(|b| *b == b'\n') {
                        Some(newline) => {
                            self.buf.drain(..consumed + newline + 1);
                        }
                        None => {
                            self.buf.clear();
                            return messages;
                        }
                    }
                }
            }
        }
    }
}

/// The worker's session with its coordinator.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    broken: bool,
    closed: bool,
}

impl Connection {
    /// Connect to the coordinator, logging progress while the attempt is
    /// pending. There is no timeout.
    pub async fn connect(host: &str, port: u16) -> Result<Self, WorkerError> {
        let addr = format!("{}:{}", host, port);
        info!(addr = %addr, "Connecting to coordinator");

        let attempt = Self::connect_any(addr.clone());
        tokio::pin!(attempt);

        let started = Instant::now();
        let mut progress = tokio::time::interval_at(started + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
        loop {
            tokio::select! {
                result = &mut attempt => {
                    return result.map_err(|source| WorkerError::Connect { addr, source });
                }
                _ = progress.tick() => {
                    info!(
                        addr = %addr,
                        waited_secs = started.elapsed().as_secs(),
                        "Still connecting to coordinator"
                    );
                }
            }
        }
    }

    async fn connect_any(addr: String) -> io::Result<Self> {
        let mut last_err = None;
        for socket_addr in tokio::net::lookup_host(addr.as_str()).await? {
            match Self::connect_addr(socket_addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(addr = %socket_addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {}", addr))
        }))
    }

    async fn connect_addr(addr: SocketAddr) -> io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;

        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;

        info!(
            peer = %addr,
            local = ?stream.local_addr().ok(),
            "Connected to coordinator"
        );

        Ok(Self {
            stream,
            peer: addr,
            decoder: FrameDecoder::new(),
            read_buf: vec![0; READ_CHUNK],
            broken: false,
            closed: false,
        })
    }

    /// Local port of the session, the source of the worker identity.
    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.stream.local_addr()?.port())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Returns true once a send or read has failed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Write one message as a single frame.
    pub async fn send(&mut self, message: &Message) -> io::Result<()> {
        if self.broken || self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "coordinator session is closed",
            ));
        }

        let frame = message
            .to_frame()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Err(e) = self.stream.write_all(&frame).await {
            warn!(error = %e, kind = message.kind(), "Send to coordinator failed");
            self.broken = true;
            return Err(e);
        }
        trace!(kind = message.kind(), req_id = ?message.req_id(), "Sent message");
        Ok(())
    }

    /// Read whatever is available without waiting and return the complete
    /// messages in it.
    pub fn receive(&mut self) -> io::Result<Inbound> {
        let mut inbound = Inbound::default();
        if self.closed {
            inbound.eof = true;
            return Ok(inbound);
        }

        loop {
            match self.stream.try_read(&mut self.read_buf) {
                Ok(0) => {
                    inbound.eof = true;
                    break;
                }
                Ok(n) => self.decoder.push(&self.read_buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            }
        }

        inbound.messages = self.decoder.decode();
        Ok(inbound)
    }

    /// Wait until the socket has data (or EOF) to read.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Shut the session down. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "Error shutting down coordinator session");
        }
        info!(peer = %self.peer, "Coordinator session closed");
    }
}
