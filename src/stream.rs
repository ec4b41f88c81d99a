//! Command Streaming
//!
//! Reads newline-delimited operator commands from stdin, runs each one
//! against the controller and reports its progress as JSON events.

use crate::{json_output, PmdController};
use anyhow::Result;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

/// One line of operator input
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonCommand {
    /// Absolute move in encoder counts
    Move(i64),
    /// Waveform steps; `None` uses the configured jog size
    Jog(Option<i64>),
    /// Step rate in Hz
    Rate(u32),
    Stop,
    Park,
    Unpark,
    Reset,
    ClearIndex,
    Status,
    /// Request text passed through unchanged
    Raw(String),
    Quit,
}

impl FromStr for DaemonCommand {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let no_argument = |command: DaemonCommand| {
            if rest.is_empty() {
                Ok(command)
            } else {
                Err(format!("'{}' takes no argument", verb))
            }
        };

        match verb.to_ascii_lowercase().as_str() {
            "move" => parse_argument(verb, rest).map(DaemonCommand::Move),
            "jog" if rest.is_empty() => Ok(DaemonCommand::Jog(None)),
            "jog" => parse_argument(verb, rest).map(|steps| DaemonCommand::Jog(Some(steps))),
            "rate" => parse_argument(verb, rest).map(DaemonCommand::Rate),
            "stop" => no_argument(DaemonCommand::Stop),
            "park" => no_argument(DaemonCommand::Park),
            "unpark" => no_argument(DaemonCommand::Unpark),
            "reset" => no_argument(DaemonCommand::Reset),
            "clear-index" => no_argument(DaemonCommand::ClearIndex),
            "status" => no_argument(DaemonCommand::Status),
            "quit" | "exit" => no_argument(DaemonCommand::Quit),
            "raw" if !rest.is_empty() => Ok(DaemonCommand::Raw(rest.to_string())),
            "raw" => Err("'raw' needs request text".to_string()),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

fn parse_argument<T: FromStr>(verb: &str, rest: &str) -> std::result::Result<T, String> {
    if rest.is_empty() {
        return Err(format!("'{}' needs a numeric argument", verb));
    }
    rest.parse()
        .map_err(|_| format!("invalid argument for '{}': {}", verb, rest))
}

impl fmt::Display for DaemonCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonCommand::Move(counts) => write!(f, "move {}", counts),
            DaemonCommand::Jog(Some(steps)) => write!(f, "jog {}", steps),
            DaemonCommand::Jog(None) => f.write_str("jog"),
            DaemonCommand::Rate(hz) => write!(f, "rate {}", hz),
            DaemonCommand::Stop => f.write_str("stop"),
            DaemonCommand::Park => f.write_str("park"),
            DaemonCommand::Unpark => f.write_str("unpark"),
            DaemonCommand::Reset => f.write_str("reset"),
            DaemonCommand::ClearIndex => f.write_str("clear-index"),
            DaemonCommand::Status => f.write_str("status"),
            DaemonCommand::Raw(text) => write!(f, "raw {}", text),
            DaemonCommand::Quit => f.write_str("quit"),
        }
    }
}

impl DaemonCommand {
    /// Run against the controller. Blocking; returns the controller's reply
    /// where the command produced one.
    pub fn execute(&self, controller: &PmdController) -> crate::Result<Option<String>> {
        match self {
            DaemonCommand::Move(counts) => controller.move_to(*counts).map(Some),
            DaemonCommand::Jog(steps) => {
                let steps = steps.unwrap_or_else(|| i64::from(controller.config().motor.jog_steps));
                controller.jog(steps).map(Some)
            }
            DaemonCommand::Rate(hz) => controller.set_step_rate(*hz).map(|_| None),
            DaemonCommand::Stop => controller.stop().map(Some),
            DaemonCommand::Park => controller.park().map(Some),
            DaemonCommand::Unpark => controller.unpark().map(Some),
            DaemonCommand::Reset => {
                controller.reset_error();
                Ok(None)
            }
            DaemonCommand::ClearIndex => {
                controller.clear_index();
                Ok(None)
            }
            DaemonCommand::Status => Ok(Some(controller.status_text())),
            DaemonCommand::Raw(text) => controller.send_request(text).map(Some),
            DaemonCommand::Quit => Ok(None),
        }
    }
}

/// Command stream bound to one controller
pub struct CommandStream {
    controller: Arc<PmdController>,
    shutdown_signal: Arc<AtomicBool>,
    command_count: u32,
    eof_logged: bool,
}

impl CommandStream {
    pub fn new(controller: Arc<PmdController>, shutdown_signal: Arc<AtomicBool>) -> Self {
        Self {
            controller,
            shutdown_signal,
            command_count: 0,
            eof_logged: false,
        }
    }

    /// Process stdin until `quit`, a read error, or Ctrl+C/SIGTERM.
    ///
    /// On a signal the motor is stopped before returning. The caller owns
    /// the final shutdown of the controller.
    pub async fn run(&mut self) -> Result<()> {
        info!("Command streaming active - enter PMD commands");
        info!("Use Ctrl+C to stop the motor and exit");

        let mut reader = BufReader::new(io::stdin());
        let mut buffer = String::new();

        let shutdown = Self::setup_shutdown_handler();
        tokio::pin!(shutdown);

        loop {
            buffer.clear();

            tokio::select! {
                line_result = reader.read_line(&mut buffer) => {
                    match line_result {
                        Ok(0) => {
                            if !self.eof_logged {
                                info!("End of input reached, continuing to wait for more commands...");
                                self.eof_logged = true;
                            }
                            if self.shutdown_signal.load(Ordering::Relaxed) {
                                break;
                            }
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        Ok(_) => {
                            self.eof_logged = false;
                            let line = buffer.trim();
                            if line.is_empty() || line.starts_with('#') {
                                continue;
                            }

                            match line.parse::<DaemonCommand>() {
                                Ok(DaemonCommand::Quit) => {
                                    info!("Quit requested");
                                    break;
                                }
                                Ok(command) => self.process_command(command).await,
                                Err(reason) => {
                                    warn!("Rejected input '{}': {}", line, reason);
                                    json_output::output::command_rejected(line, &reason);
                                }
                            }
                        }
                        Err(e) => {
                            error!("Failed to read from stdin: {}", e);
                            json_output::output::error(&format!("stdin read failed: {}", e));
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received - stopping motor");
                    self.shutdown_signal.store(true, Ordering::Relaxed);

                    let controller = Arc::clone(&self.controller);
                    match tokio::task::spawn_blocking(move || controller.stop()).await {
                        Ok(Ok(_)) => json_output::output::command_sent(0, "stop"),
                        Ok(Err(e)) => error!("Failed to stop motor: {}", e),
                        Err(e) => error!("Stop task failed: {}", e),
                    }
                    break;
                }
            }
        }

        self.shutdown_signal.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Set up signal handlers for graceful shutdown
    async fn setup_shutdown_handler() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    /// Run one command on the blocking pool and report sent/completed/failed
    async fn process_command(&mut self, command: DaemonCommand) {
        self.command_count += 1;
        let command_id = self.command_count;
        json_output::output::command_sent(command_id, &command.to_string());

        let controller = Arc::clone(&self.controller);
        let task_command = command.clone();
        let outcome = tokio::task::spawn_blocking(move || task_command.execute(&controller)).await;

        match outcome {
            Ok(Ok(reply)) => json_output::output::command_completed(command_id, reply),
            Ok(Err(e)) => {
                error!("Command '{}' failed: {}", command, e);
                json_output::output::command_failed(command_id, &e.to_string());
            }
            Err(e) => {
                error!("Command task for '{}' failed: {}", command, e);
                json_output::output::command_failed(command_id, &e.to_string());
            }
        }
    }
}
