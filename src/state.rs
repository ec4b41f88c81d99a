//! Device state machine
//!
//! Folds each decoded status, request outcome and explicit command into a
//! coarse [`DeviceState`]. Transient states (Moving, Alarm from status bits,
//! Unknown after a lost reply) fall back to the remembered previous stable
//! state once the condition clears.

use crate::status::{DecodedStatus, StatusFlag};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    On,
    Off,
    Moving,
    Alarm,
    Unknown,
    Parked,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::On => "ON",
            DeviceState::Off => "OFF",
            DeviceState::Moving => "MOVING",
            DeviceState::Alarm => "ALARM",
            DeviceState::Unknown => "UNKNOWN",
            DeviceState::Parked => "PARKED",
        };
        f.write_str(name)
    }
}

/// Per-bit conditions mirrored from the latest status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideFlags {
    pub in_position: bool,
    pub parked: bool,
    pub reverse: bool,
    pub overheat: bool,
    pub external_limit: bool,
    pub script_running: bool,
    /// Latched until [`StateMachine::clear_index`]
    pub index_found: bool,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: DeviceState,
    previous: DeviceState,
    flags: SideFlags,
    /// A `!` reply was seen; holds Alarm until reset
    rejected: bool,
    /// Bumped by every change that does not come from a status read
    generation: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: DeviceState::On,
            previous: DeviceState::On,
            flags: SideFlags::default(),
            rejected: false,
            generation: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn previous(&self) -> DeviceState {
        self.previous
    }

    pub fn flags(&self) -> SideFlags {
        self.flags
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    /// Status read before a change to this value must not be applied
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply one poll cycle's decoded status. Returns the resulting state.
    pub fn apply_status(&mut self, status: &DecodedStatus) -> DeviceState {
        let prior = self.state;
        let target_mode = status.contains(StatusFlag::TargetMode);
        let target_reached = status.contains(StatusFlag::TargetReached);

        if status.has_error() {
            if self.state != DeviceState::Alarm {
                self.previous = self.state;
                self.state = DeviceState::Alarm;
            }
        } else if status.contains(StatusFlag::Running) {
            self.state = DeviceState::Moving;
        } else if target_mode && !target_reached {
            if self.state != DeviceState::Moving {
                self.previous = self.state;
                self.state = DeviceState::Moving;
            }
        } else if target_mode && target_reached {
            self.state = DeviceState::On;
            self.previous = DeviceState::On;
        } else if self.state != self.previous {
            self.state = self.previous;
        }

        if status.contains(StatusFlag::XLimit) || self.rejected {
            self.state = DeviceState::Alarm;
        }

        self.flags = SideFlags {
            in_position: target_reached,
            parked: status.contains(StatusFlag::Parked),
            reverse: status.contains(StatusFlag::Reverse),
            overheat: status.contains(StatusFlag::Overheat),
            external_limit: status.contains(StatusFlag::XLimit),
            script_running: status.contains(StatusFlag::Script),
            index_found: self.flags.index_found || status.contains(StatusFlag::Index),
        };

        if self.state != prior {
            tracing::debug!("State {} -> {} (status: {})", prior, self.state, status);
        }
        self.state
    }

    /// Set the current state without touching the previous stable state.
    ///
    /// Motion commands use this to report Moving before the next poll sees it.
    pub fn force(&mut self, state: DeviceState) {
        self.state = state;
        self.generation += 1;
    }

    /// Set both the current and the previous stable state
    pub fn settle(&mut self, state: DeviceState) {
        self.state = state;
        self.previous = state;
        self.generation += 1;
    }

    /// A request went unanswered or the link dropped
    pub fn mark_unknown(&mut self) {
        if self.state != DeviceState::Unknown {
            self.previous = self.state;
            self.state = DeviceState::Unknown;
        }
        self.generation += 1;
    }

    /// The controller answered with `!`
    pub fn mark_rejected(&mut self) {
        self.rejected = true;
        self.settle(DeviceState::Alarm);
    }

    /// Clear a latched rejection and return to On
    pub fn reset_error(&mut self) {
        self.rejected = false;
        self.settle(DeviceState::On);
    }

    pub fn clear_index(&mut self) {
        self.flags.index_found = false;
        self.generation += 1;
    }
}
