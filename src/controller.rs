//! PMD Controller
//!
//! Owns the transport behind the acquisition lock, the shared device status
//! and the status poller, and exposes the motor commands built on them.
//!
//! Lock order: the acquisition lock may be taken before the status lock,
//! never the other way round.

use crate::{
    config::DaemonConfig,
    json_output::current_timestamp,
    monitoring::ControllerSnapshot,
    poller::{PollCycle, PollTarget, StatusPoller},
    protocol::{self, Request},
    state::{DeviceState, SideFlags, StateMachine},
    status::DecodedStatus,
    transport::{RequestTransport, TransportConfig},
    PmdError, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shared device status; written by the poller and the request path
#[derive(Debug, Clone)]
struct DeviceStatus {
    encoder_position: i64,
    raw_status: String,
    decoded: DecodedStatus,
    update_rate: Duration,
    step_rate: u32,
    /// Cleared by connection failures, set by any reply
    link_up: bool,
    machine: StateMachine,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            link_up: true,
            encoder_position: 0,
            raw_status: String::new(),
            decoded: DecodedStatus::empty(),
            update_rate: Duration::ZERO,
            step_rate: 0,
            machine: StateMachine::new(),
        }
    }
}

/// State shared between the controller and its poller thread
pub(crate) struct ControllerCore {
    /// The acquisition lock: held for a whole request/reply round trip
    acquisition: Mutex<Option<RequestTransport>>,
    status: Mutex<DeviceStatus>,
}

impl ControllerCore {
    fn new(transport: RequestTransport) -> Self {
        Self {
            acquisition: Mutex::new(Some(transport)),
            status: Mutex::new(DeviceStatus::default()),
        }
    }

    /// One serialized round trip, folding the outcome into the state machine.
    ///
    /// `force` is applied once the acquisition lock is held, so any status
    /// read still in flight predates it and is discarded at commit.
    fn round_trip(&self, text: &str, force: Option<DeviceState>) -> Result<String> {
        let outcome = {
            let transport = self.acquisition.lock();
            match transport.as_ref() {
                Some(transport) => {
                    if let Some(state) = force {
                        self.status.lock().machine.force(state);
                    }
                    transport.send_request(text)
                }
                // After shutdown; the state stays Off
                None => return Err(PmdError::Connection("controller is shut down".to_string())),
            }
        };

        let mut status = self.status.lock();
        match outcome {
            Ok(reply) if protocol::is_rejected(&reply) => {
                warn!("Controller rejected '{}': {}", text, reply);
                status.link_up = true;
                status.machine.mark_rejected();
                Err(PmdError::HardwareRejected {
                    request: text.to_string(),
                    reply,
                })
            }
            Ok(reply) => {
                status.link_up = true;
                Ok(reply)
            }
            Err(e) => {
                if e.is_connection() {
                    if status.link_up {
                        error!("Lost connection to controller: {}", e);
                    }
                    status.link_up = false;
                }
                if e.is_timeout() || e.is_connection() {
                    status.machine.mark_unknown();
                }
                Err(e)
            }
        }
    }
}

impl PollTarget for ControllerCore {
    fn request(&self, request: &Request) -> Result<String> {
        self.round_trip(&request.to_wire(), None)
    }

    fn state_generation(&self) -> u64 {
        self.status.lock().machine.generation()
    }

    fn commit(&self, cycle: PollCycle) {
        let mut status = self.status.lock();
        if let Some(position) = cycle.encoder_position {
            status.encoder_position = position;
        }
        if let Some((raw, decoded)) = cycle.status {
            status.raw_status = raw;
            status.decoded = decoded;
            if cycle.generation == status.machine.generation() {
                status.machine.apply_status(&decoded);
            } else {
                debug!("Skipping status read from before a state change ({})", status.machine.state());
            }
        }
        status.update_rate = cycle.elapsed;
    }
}

/// Driver for one PMD controller behind a serial-to-Ethernet bridge
pub struct PmdController {
    config: DaemonConfig,
    core: Arc<ControllerCore>,
    poller: Mutex<Option<StatusPoller>>,
}

impl PmdController {
    /// Connect using the host, port and transport settings from `config`.
    pub fn connect(config: DaemonConfig) -> Result<Self> {
        let transport = RequestTransport::connect(
            &config.controller.host,
            config.controller.port,
            TransportConfig::from(&config.transport),
        )?;

        Ok(Self {
            config,
            core: Arc::new(ControllerCore::new(transport)),
            poller: Mutex::new(None),
        })
    }

    /// Connect to `host:port` with default settings otherwise
    pub fn connect_to(host: &str, port: u16) -> Result<Self> {
        let mut config = DaemonConfig::default();
        config.controller.host = host.to_string();
        config.controller.port = port;
        Self::connect(config)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Bring the controller into its working configuration: start polling
    /// (if configured), apply the maximum step rate and switch the external
    /// limit behaviour.
    pub fn initialize(&self) -> Result<()> {
        info!("Initializing PMD controller at {}:{}", self.config.controller.host, self.config.controller.port);

        if self.config.polling.autostart {
            self.start_polling()?;
        }
        self.set_step_rate(self.config.motor.max_step_rate)?;
        self.switch_ext_limit()?;

        info!("PMD controller initialized");
        Ok(())
    }

    // --- raw access -----------------------------------------------------

    /// Send any request text and return the controller's reply.
    pub fn send_request(&self, text: &str) -> Result<String> {
        self.core.round_trip(text, None)
    }

    /// Send a typed request. Motion requests report Moving immediately.
    pub fn execute(&self, request: &Request) -> Result<String> {
        let force = request.commands_motion().then_some(DeviceState::Moving);
        self.core.round_trip(&request.to_wire(), force)
    }

    // --- polling --------------------------------------------------------

    /// Start the background poller; no-op if already running.
    pub fn start_polling(&self) -> Result<()> {
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(StatusPoller::is_running) {
            return Ok(());
        }
        *poller = Some(StatusPoller::spawn(Arc::clone(&self.core), self.config.polling.period())?);
        Ok(())
    }

    /// Stop the poller and wait until its thread has exited.
    pub fn stop_polling(&self) {
        let poller = self.poller.lock().take();
        if let Some(mut poller) = poller {
            poller.stop();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller.lock().as_ref().is_some_and(StatusPoller::is_running)
    }

    // --- motor commands -------------------------------------------------

    /// Move to an absolute encoder count
    pub fn move_to(&self, counts: i64) -> Result<String> {
        self.execute(&Request::MoveTo(counts))
    }

    /// Set the waveform step rate (Hz) used for subsequent moves.
    ///
    /// Both writes are always sent; the rate is recorded only if both succeed.
    pub fn set_step_rate(&self, rate: u32) -> Result<()> {
        let parameter = self.execute(&Request::StepRateParameter(rate));
        let step_rate = self.execute(&Request::StepRate(rate));
        parameter?;
        step_rate?;
        self.core.status.lock().step_rate = rate;
        Ok(())
    }

    pub fn stop(&self) -> Result<String> {
        let reply = self.execute(&Request::Stop)?;
        self.force_state(DeviceState::On);
        Ok(reply)
    }

    pub fn park(&self) -> Result<String> {
        let reply = self.execute(&Request::Park)?;
        self.core.status.lock().machine.settle(DeviceState::Parked);
        Ok(reply)
    }

    pub fn unpark(&self) -> Result<String> {
        let reply = self.execute(&Request::Unpark)?;
        self.core.status.lock().machine.settle(DeviceState::On);
        Ok(reply)
    }

    /// Jog by `steps` waveform steps; negative jogs backwards
    pub fn jog(&self, steps: i64) -> Result<String> {
        self.execute(&Request::Jog(steps))
    }

    pub fn switch_ext_limit(&self) -> Result<String> {
        self.execute(&Request::SwitchExtLimit)
    }

    /// Clear a latched rejection or alarm and return to On
    pub fn reset_error(&self) {
        self.core.status.lock().machine.reset_error();
    }

    pub fn clear_index(&self) {
        self.core.status.lock().machine.clear_index();
    }

    /// Override the current state, keeping the previous stable state
    pub fn force_state(&self, state: DeviceState) {
        self.core.status.lock().machine.force(state);
    }

    // --- accessors ------------------------------------------------------

    pub fn current_state(&self) -> DeviceState {
        self.core.status.lock().machine.state()
    }

    pub fn previous_state(&self) -> DeviceState {
        self.core.status.lock().machine.previous()
    }

    pub fn current_status_flags(&self) -> DecodedStatus {
        self.core.status.lock().decoded
    }

    pub fn current_encoder_position(&self) -> i64 {
        self.core.status.lock().encoder_position
    }

    pub fn raw_status(&self) -> String {
        self.core.status.lock().raw_status.clone()
    }

    pub fn side_flags(&self) -> SideFlags {
        self.core.status.lock().machine.flags()
    }

    /// Duration of the last completed poll cycle
    pub fn update_rate(&self) -> Duration {
        self.core.status.lock().update_rate
    }

    pub fn step_rate(&self) -> u32 {
        self.core.status.lock().step_rate
    }

    pub fn status_text(&self) -> String {
        format!("Controller status is: {}", self.current_status_flags())
    }

    /// False once a request has failed on a broken link, or after shutdown
    pub fn is_connected(&self) -> bool {
        self.core.status.lock().link_up
    }

    /// Consistent view of all observable state
    pub fn snapshot(&self) -> ControllerSnapshot {
        let status = self.core.status.lock().clone();

        ControllerSnapshot {
            stime: current_timestamp(),
            event_type: "controller_state".to_string(),
            connected: status.link_up,
            state: status.machine.state(),
            previous_state: status.machine.previous(),
            encoder_position: status.encoder_position,
            raw_status: status.raw_status,
            status_flags: status.decoded,
            side_flags: status.machine.flags(),
            update_rate_ms: status.update_rate.as_secs_f64() * 1000.0,
            step_rate: status.step_rate,
            enc_res_nm: self.config.motor.enc_res_nm,
            enc_sign: self.config.motor.enc_sign,
        }
    }

    // --- teardown -------------------------------------------------------

    /// Stop the motor, then the poller, writer, reader and socket, in that order.
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.core.acquisition.lock().is_none() {
            return;
        }
        info!("Stopping motor and releasing controller");

        if self.is_connected() {
            if let Err(e) = self.execute(&Request::Stop) {
                error!("Error stopping motor during shutdown: {}", e);
            }
        }

        self.stop_polling();

        let transport = self.core.acquisition.lock().take();
        if let Some(mut transport) = transport {
            transport.shutdown();
        }

        let mut status = self.core.status.lock();
        status.link_up = false;
        status.machine.settle(DeviceState::Off);
    }
}

impl Drop for PmdController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
