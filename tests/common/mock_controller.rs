//! Simulated PMD controller behind a TCP bridge
//!
//! Speaks the line protocol on 127.0.0.1 with an encoder count and a status
//! payload the test can change at any time, plus scripted faults.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How the mock answers each request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyMode {
    Normal,
    /// Never answer
    Silent,
    /// Write each reply in two chunks with a pause between
    Split,
    /// Follow each reply with blank CR/LF lines in the same write
    Padded,
    /// Answer only after the given delay
    Late(Duration),
}

#[derive(Debug)]
pub struct MockState {
    pub encoder: i64,
    pub status: String,
    pub mode: ReplyMode,
    /// Requests starting with this prefix are answered with `!`
    pub reject_prefix: Option<String>,
    /// Status payload the controller switches to when it accepts `X0T`
    pub status_on_move: Option<String>,
    /// Close the connection at the next opportunity
    pub hang_up: bool,
    /// Every request received, in order
    pub received: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            encoder: 0,
            status: "0000".to_string(),
            mode: ReplyMode::Normal,
            reject_prefix: None,
            status_on_move: None,
            hang_up: false,
            received: Vec::new(),
        }
    }
}

pub struct MockController {
    port: u16,
    state: Arc<Mutex<MockState>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockController {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock controller");
        let port = listener.local_addr().expect("mock address").port();
        listener.set_nonblocking(true).expect("nonblocking listener");

        let state = Arc::new(Mutex::new(MockState::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_state = Arc::clone(&state);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || serve(listener, thread_state, thread_stop));

        Self {
            port,
            state,
            stop,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_encoder(&self, counts: i64) {
        self.state.lock().unwrap().encoder = counts;
    }

    pub fn set_status(&self, payload: &str) {
        self.state.lock().unwrap().status = payload.to_string();
    }

    pub fn set_mode(&self, mode: ReplyMode) {
        self.state.lock().unwrap().mode = mode;
    }

    pub fn reject_requests_starting_with(&self, prefix: &str) {
        self.state.lock().unwrap().reject_prefix = Some(prefix.to_string());
    }

    pub fn set_status_on_move(&self, payload: &str) {
        self.state.lock().unwrap().status_on_move = Some(payload.to_string());
    }

    /// Drop the client connection as if the bridge went away
    pub fn hang_up(&self) {
        self.state.lock().unwrap().hang_up = true;
    }

    pub fn received(&self) -> Vec<String> {
        self.state.lock().unwrap().received.clone()
    }

    /// Received requests other than the poller's reads
    pub fn received_commands(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|r| r != "X0E" && r != "X0U4")
            .collect()
    }
}

impl Drop for MockController {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(listener: TcpListener, state: Arc<Mutex<MockState>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                handle_connection(stream, &state, &stop);
                return;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(2)),
            Err(_) => return,
        }
    }
}

fn handle_connection(mut stream: TcpStream, state: &Mutex<MockState>, stop: &AtomicBool) {
    stream.set_nonblocking(false).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
    let mut pending = Vec::new();
    let mut buffer = [0u8; 256];

    while !stop.load(Ordering::Relaxed) {
        if state.lock().unwrap().hang_up {
            return;
        }
        let n = match stream.read(&mut buffer) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(_) => return,
        };

        for &byte in &buffer[..n] {
            if byte != b'\n' && byte != b'\r' {
                pending.push(byte);
                continue;
            }
            if pending.is_empty() {
                continue;
            }
            let request = String::from_utf8_lossy(&pending).into_owned();
            pending.clear();

            let (reply, mode) = answer(state, &request);
            if write_reply(&mut stream, &reply, mode, stop).is_err() {
                return;
            }
        }
    }
}

fn answer(state: &Mutex<MockState>, request: &str) -> (String, ReplyMode) {
    let mut state = state.lock().unwrap();
    state.received.push(request.to_string());

    let rejected = state
        .reject_prefix
        .as_deref()
        .is_some_and(|prefix| request.starts_with(prefix));

    let reply = if rejected {
        format!("{}!", request)
    } else if request == "X0E" {
        format!("X0E:{}", state.encoder)
    } else if request == "X0U4" {
        format!("X0U4:{}", state.status)
    } else if let Some(target) = request.strip_prefix("X0T").and_then(|n| n.parse::<i64>().ok()) {
        state.encoder = target;
        if let Some(status) = state.status_on_move.clone() {
            state.status = status;
        }
        format!("{}:{}", request, target)
    } else {
        format!("{}:OK", request)
    };
    (reply, state.mode)
}

fn write_reply(stream: &mut TcpStream, reply: &str, mode: ReplyMode, stop: &AtomicBool) -> std::io::Result<()> {
    match mode {
        ReplyMode::Normal => stream.write_all(format!("{}\r\n", reply).as_bytes()),
        ReplyMode::Silent => Ok(()),
        ReplyMode::Split => {
            let (head, tail) = reply.split_at(reply.len() / 2);
            stream.write_all(head.as_bytes())?;
            stream.flush()?;
            thread::sleep(Duration::from_millis(5));
            stream.write_all(format!("{}\r\n", tail).as_bytes())
        }
        ReplyMode::Padded => stream.write_all(format!("{}\r\n\r\n\n", reply).as_bytes()),
        ReplyMode::Late(delay) => {
            let deadline = std::time::Instant::now() + delay;
            while std::time::Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
            stream.write_all(format!("{}\r\n", reply).as_bytes())
        }
    }
}
