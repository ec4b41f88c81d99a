//! JSON-based Controller Monitoring
//!
//! Publishes controller snapshots as JSON lines, rate limited and, in
//! change-only mode, suppressed while nothing observable has changed.

use serde::Serialize;
use std::time::{Duration, Instant};
use crate::{
    state::{DeviceState, SideFlags},
    status::DecodedStatus,
};

/// Everything the controller knows, taken under one lock
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    /// System timestamp (Unix epoch seconds)
    pub stime: f64,
    /// Event type for JSON output
    #[serde(rename = "type")]
    pub event_type: String,
    pub connected: bool,
    pub state: DeviceState,
    pub previous_state: DeviceState,
    /// Last encoder count read by the poller
    pub encoder_position: i64,
    /// Last status payload as received, e.g. `0021`
    pub raw_status: String,
    pub status_flags: DecodedStatus,
    #[serde(flatten)]
    pub side_flags: SideFlags,
    /// Duration of the last poll cycle
    pub update_rate_ms: f64,
    pub step_rate: u32,
    /// Encoder resolution in nm, for consumers converting counts
    pub enc_res_nm: f64,
    pub enc_sign: i32,
}

impl ControllerSnapshot {
    /// Human-readable status line
    pub fn status_text(&self) -> String {
        format!("Controller status is: {}", self.status_flags)
    }

    fn change_key(&self) -> ChangeKey {
        ChangeKey {
            connected: self.connected,
            state: self.state,
            encoder_position: self.encoder_position,
            raw_status: self.raw_status.clone(),
            side_flags: self.side_flags,
            step_rate: self.step_rate,
        }
    }
}

/// Fields whose change triggers output; timing fields are excluded
#[derive(Debug, Clone, PartialEq)]
struct ChangeKey {
    connected: bool,
    state: DeviceState,
    encoder_position: i64,
    raw_status: String,
    side_flags: SideFlags,
    step_rate: u32,
}

/// Monitor output manager that handles change detection and rate limiting
pub struct MonitorOutput {
    last_key: Option<ChangeKey>,
    last_output: Option<Instant>,
    min_interval: Duration,
    only_on_change: bool,
}

impl MonitorOutput {
    pub fn new(pub_rate_hz: u32, only_on_change: bool) -> Self {
        Self {
            last_key: None,
            last_output: None,
            min_interval: Duration::from_secs_f64(1.0 / pub_rate_hz.max(1) as f64),
            only_on_change,
        }
    }

    /// Check if the snapshot should be output, recording it if so
    pub fn should_output(&mut self, snapshot: &ControllerSnapshot) -> bool {
        self.should_output_at(snapshot, Instant::now())
    }

    fn should_output_at(&mut self, snapshot: &ControllerSnapshot, now: Instant) -> bool {
        if let Some(last_output) = self.last_output {
            if now.duration_since(last_output) < self.min_interval {
                return false;
            }
        }

        let key = snapshot.change_key();
        if self.only_on_change && self.last_key.as_ref() == Some(&key) {
            return false;
        }

        self.last_key = Some(key);
        self.last_output = Some(now);
        true
    }

    pub fn render(snapshot: &ControllerSnapshot) -> serde_json::Result<String> {
        serde_json::to_string(snapshot)
    }

    /// Print the snapshot as one JSON line on stdout
    pub fn output(&self, snapshot: &ControllerSnapshot) {
        match Self::render(snapshot) {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::debug!("Failed to serialize snapshot: {}", e),
        }
    }
}
