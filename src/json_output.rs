//! JSON Output for Daemon Commands
//!
//! Provides structured JSON output for command status, events, and errors
//! that can be consumed by external tools and monitoring systems.

use serde::{Deserialize, Serialize};

/// Get current timestamp as f64 seconds since UNIX epoch with consistent precision
pub fn current_timestamp() -> f64 {
    let micros = chrono::Utc::now().timestamp_micros();
    micros as f64 / 1_000_000.0
}

/// Command execution status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Sent,
    Completed,
    Failed,
}

/// Command status event output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusEvent {
    /// Timestamp when event occurred
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    /// Sequence number assigned by the command stream
    pub command_id: u32,
    /// Current status of the command
    pub status: CommandStatus,
    /// Human-readable message
    pub message: String,
    /// Original command text (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Raw controller reply, when there was one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

/// Error event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Timestamp when error occurred
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    /// Associated command ID if applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u32>,
    /// Error message
    pub error: String,
}

impl CommandStatusEvent {
    pub fn new(command_id: u32, status: CommandStatus, message: &str, command: Option<String>, reply: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "command_status".to_string(),
            command_id,
            status,
            message: message.to_string(),
            command,
            reply,
        }
    }

    pub fn sent(command_id: u32, command: &str) -> Self {
        Self::new(command_id, CommandStatus::Sent, "Command sent to controller", Some(command.to_string()), None)
    }

    pub fn completed(command_id: u32, reply: Option<String>) -> Self {
        Self::new(command_id, CommandStatus::Completed, "Command execution finished", None, reply)
    }

    pub fn failed(command_id: u32, error_msg: &str) -> Self {
        Self::new(command_id, CommandStatus::Failed, error_msg, None, None)
    }
}

impl ErrorEvent {
    pub fn new(error: &str, command_id: Option<u32>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            command_id,
            error: error.to_string(),
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;

    pub fn command_sent(command_id: u32, command: &str) {
        output_event(&CommandStatusEvent::sent(command_id, command));
    }

    pub fn command_completed(command_id: u32, reply: Option<String>) {
        output_event(&CommandStatusEvent::completed(command_id, reply));
    }

    pub fn command_failed(command_id: u32, error: &str) {
        output_event(&CommandStatusEvent::failed(command_id, error));
    }

    /// Unparseable input line (command ID 0)
    pub fn command_rejected(command: &str, reason: &str) {
        output_event(&CommandStatusEvent::new(
            0,
            CommandStatus::Failed,
            &format!("Command rejected: {}", reason),
            Some(command.to_string()),
            None,
        ));
    }

    pub fn error(error_msg: &str) {
        output_event(&ErrorEvent::new(error_msg, None));
    }
}
