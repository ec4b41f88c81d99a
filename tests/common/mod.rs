#![allow(dead_code)]

pub mod mock_controller;

use pmdd::{DaemonConfig, PmdController};
use std::time::{Duration, Instant};

/// Config pointing at a local mock, with polling left to the test
pub fn mock_config(port: u16) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.controller.host = "127.0.0.1".to_string();
    config.controller.port = port;
    config.transport.request_timeout_ms = 200;
    config.polling.autostart = false;
    config.polling.period_us = 500;
    config
}

pub fn connect(port: u16) -> PmdController {
    PmdController::connect(mock_config(port)).expect("connect to mock controller")
}

pub fn wait_for_condition<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
