//! PMDD - PiezoMotor PMD controller driver
//!
//! Talks to a PMD motion controller through a serial-to-Ethernet bridge:
//! one request in flight at a time, replies correlated in FIFO order, a
//! background poller keeping encoder position and status fresh, and a
//! state machine folding status bits into a coarse device state.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pmdd::{DaemonConfig, PmdController};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DaemonConfig::load_from_path("config/default_config.yaml")?;
//!     let controller = PmdController::connect(config)?;
//!     controller.initialize()?;
//!
//!     controller.move_to(1500)?;
//!     println!("{} at {}", controller.current_state(), controller.current_encoder_position());
//!
//!     controller.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **RequestTransport**: socket plus reader/writer threads, line framing
//! - **StatusPoller**: background encoder/status reads
//! - **StateMachine**: status bits to [`DeviceState`]
//! - **PmdController**: acquisition lock, shared status, motor commands
//! - **CommandStream**: stdin command loop for the daemon binary

pub mod config;
pub mod controller;
pub mod error;
pub mod json_output;
pub mod monitoring;
pub mod poller;
pub mod protocol;
pub mod state;
pub mod status;
pub mod stream;
pub mod transport;

pub use config::{ControllerConfig, DaemonConfig, MotorConfig, PollingConfig, PublishingConfig, TransportSettings};
pub use controller::PmdController;
pub use error::{PmdError, Result};
pub use json_output::{CommandStatus, CommandStatusEvent, ErrorEvent};
pub use monitoring::{ControllerSnapshot, MonitorOutput};
pub use poller::{PollCycle, PollTarget, StatusPoller};
pub use protocol::Request;
pub use state::{DeviceState, SideFlags, StateMachine};
pub use status::{decode, DecodedStatus, StatusFlag};
pub use stream::{CommandStream, DaemonCommand};
pub use transport::{RequestTransport, TransportConfig};
