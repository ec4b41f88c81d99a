//! Request/response transport over the serial bridge socket
//!
//! One TCP connection, one writer thread and one reader thread. Outbound
//! requests and inbound replies travel through FIFO channels; the N-th reply
//! read back is the answer to the N-th request written. That only holds while
//! a single request is outstanding, which callers guarantee by holding the
//! controller's acquisition lock around every [`RequestTransport::send_request`].

use crate::{config::TransportSettings, PmdError, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Timeout for establishing the TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A reply longer than this without a terminator is flushed as-is
const MAX_PENDING_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    pub read_poll: Duration,
    pub line_terminator: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&TransportSettings::default())
    }
}

impl From<&TransportSettings> for TransportConfig {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            read_poll: settings.read_poll(),
            line_terminator: settings.line_terminator.clone(),
        }
    }
}

/// Splits the inbound byte stream into replies on CR and/or LF.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read's worth of bytes, returning every completed reply.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_PENDING_BYTES {
                    warn!("Reply exceeded {} bytes without terminator", MAX_PENDING_BYTES);
                    self.flush_into(&mut lines);
                }
            }
        }

        lines
    }

    /// Bytes received after the last terminator
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

/// Duplex request channel owning the socket and its two I/O threads
pub struct RequestTransport {
    peer: String,
    config: TransportConfig,
    socket: Option<TcpStream>,
    outbound: Option<Sender<String>>,
    inbound: Receiver<String>,
    stop_reader: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl RequestTransport {
    /// Connect to `host:port` and start the reader and writer threads.
    pub fn connect(host: &str, port: u16, config: TransportConfig) -> Result<Self> {
        let peer = format!("{}:{}", host, port);
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| PmdError::Connection(format!("Failed to resolve {}: {}", peer, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Self::from_stream(stream, peer, config),
                Err(e) => last_error = Some(e),
            }
        }

        Err(PmdError::Connection(match last_error {
            Some(e) => format!("Failed to connect to {}: {}", peer, e),
            None => format!("No addresses found for {}", peer),
        }))
    }

    fn from_stream(stream: TcpStream, peer: String, config: TransportConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.read_poll))?;

        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;

        let (outbound_tx, outbound_rx) = channel::unbounded::<String>();
        let (inbound_tx, inbound_rx) = channel::unbounded::<String>();
        let stop_reader = Arc::new(AtomicBool::new(false));

        let terminator = config.line_terminator.clone();
        let writer = thread::Builder::new()
            .name("pmd-writer".to_string())
            .spawn(move || write_loop(write_half, outbound_rx, terminator))?;

        let stop = Arc::clone(&stop_reader);
        let reader = thread::Builder::new()
            .name("pmd-reader".to_string())
            .spawn(move || read_loop(read_half, inbound_tx, stop))?;

        info!("Connected to controller bridge at {}", peer);

        Ok(Self {
            peer,
            config,
            socket: Some(stream),
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            stop_reader,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Both I/O threads are still running
    pub fn is_alive(&self) -> bool {
        let running = |handle: &Option<JoinHandle<()>>| handle.as_ref().is_some_and(|h| !h.is_finished());
        running(&self.writer) && running(&self.reader)
    }

    /// Send one request and wait for its reply using the configured timeout.
    pub fn send_request(&self, text: &str) -> Result<String> {
        self.send_request_with_timeout(text, self.config.request_timeout)
    }

    /// Send one request and wait up to `timeout` for the next inbound reply.
    ///
    /// Callers must not have another request outstanding on this transport.
    /// A reply that arrives after its request timed out is discarded here,
    /// before the next request goes out.
    pub fn send_request_with_timeout(&self, text: &str, timeout: Duration) -> Result<String> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| PmdError::Connection("transport is shut down".to_string()))?;

        for stale in self.inbound.try_iter() {
            warn!("Discarding late reply '{}' before sending '{}'", stale, text);
        }

        outbound
            .send(text.to_string())
            .map_err(|_| PmdError::Connection(format!("writer to {} has stopped", self.peer)))?;
        trace!("-> {}", text);

        match self.inbound.recv_timeout(timeout) {
            Ok(reply) => {
                trace!("<- {}", reply);
                Ok(reply)
            }
            Err(RecvTimeoutError::Timeout) => Err(PmdError::Timeout {
                request: text.to_string(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(PmdError::Connection(format!(
                "reader from {} has stopped",
                self.peer
            ))),
        }
    }

    /// Stop the writer, then the reader, then close the socket.
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.socket.is_none() {
            return;
        }

        // Dropping the only sender ends the writer's receive loop
        self.outbound.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                error!("Writer thread panicked");
            }
        }

        self.stop_reader.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("Reader thread panicked");
            }
        }

        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        info!("Disconnected from {}", self.peer);
    }
}

impl Drop for RequestTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_loop(mut stream: TcpStream, outbound: Receiver<String>, terminator: String) {
    for request in outbound.iter() {
        let frame = format!("{}{}", request, terminator);
        if let Err(e) = stream.write_all(frame.as_bytes()).and_then(|_| stream.flush()) {
            error!("Socket write failed, stopping writer: {}", e);
            break;
        }
    }
    debug!("Writer loop stopped");
}

fn read_loop(mut stream: TcpStream, inbound: Sender<String>, stop: Arc<AtomicBool>) {
    let mut framer = LineFramer::new();
    let mut buffer = [0u8; 1024];

    while !stop.load(Ordering::Relaxed) {
        match stream.read(&mut buffer) {
            Ok(0) => {
                warn!("Controller closed the connection");
                break;
            }
            Ok(n) => {
                for reply in framer.push(&buffer[..n]) {
                    if inbound.send(reply).is_err() {
                        debug!("Inbound queue dropped, stopping reader");
                        return;
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    error!("Socket read failed, stopping reader: {}", e);
                }
                break;
            }
        }
    }
    debug!("Reader loop stopped");
}
