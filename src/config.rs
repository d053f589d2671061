//! Kiosk timing and retry configuration.

use crate::error::{KioskError, Result};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::path::Path;
use std::time::Duration;

/// Polling cadence and overall cap of one wash gate.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateWindow {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cap: Duration,
}

impl GateWindow {
    pub const fn new(interval: Duration, cap: Duration) -> Self {
        Self { interval, cap }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WashStartConfig {
    pub previous_car: GateWindow,
    pub car_in_position: GateWindow,
    pub device_ready: GateWindow,
    /// Consecutive good reads before a gate counts as passed.
    pub required_consecutive: u32,
    /// Retries after the first send-mode attempt.
    pub send_mode_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub send_mode_retry_delay: Duration,
    pub confirm: GateWindow,
    /// Send-mode plus confirmation rounds before giving up.
    pub start_rounds: u32,
}

impl Default for WashStartConfig {
    fn default() -> Self {
        Self {
            previous_car: GateWindow::new(Duration::from_secs(12), Duration::from_secs(300)),
            car_in_position: GateWindow::new(Duration::from_secs(6), Duration::from_secs(180)),
            device_ready: GateWindow::new(Duration::from_secs(4), Duration::from_secs(60)),
            required_consecutive: 2,
            send_mode_retries: 3,
            send_mode_retry_delay: Duration::from_secs(1),
            confirm: GateWindow::new(Duration::from_secs(1), Duration::from_secs(10)),
            start_rounds: 3,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KioskConfig {
    /// ISO currency handed to the cash device on payout.
    pub currency: String,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Minimum spacing of paid-amount updates pushed to the UI.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub paid_update_min_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub payment_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub session_start_timeout: Duration,
    /// Level reads attempted per device when finalizing.
    pub levels_read_attempts: u32,
    /// Attempts per dispensed piece.
    pub dispense_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub dispense_retry_delay: Duration,
    pub wash: WashStartConfig,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            currency: "EUR".to_string(),
            poll_interval: Duration::from_millis(400),
            paid_update_min_interval: Duration::from_millis(250),
            payment_timeout: Duration::from_secs(60),
            session_start_timeout: Duration::from_secs(5),
            levels_read_attempts: 3,
            dispense_attempts: 3,
            dispense_retry_delay: Duration::from_millis(200),
            wash: WashStartConfig::default(),
        }
    }
}

impl KioskConfig {
    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let poll_range = Duration::from_millis(100)..=Duration::from_secs(5);
        if !poll_range.contains(&self.poll_interval) {
            return Err(KioskError::Config(format!(
                "poll_interval must be within 100ms..=5s, got {:?}",
                self.poll_interval
            )));
        }
        if self.currency.trim().is_empty() {
            return Err(KioskError::Config("currency must not be empty".into()));
        }
        if self.payment_timeout.is_zero() || self.session_start_timeout.is_zero() {
            return Err(KioskError::Config("timeouts must be non-zero".into()));
        }
        if self.levels_read_attempts == 0 || self.dispense_attempts == 0 {
            return Err(KioskError::Config("attempt counts must be at least 1".into()));
        }
        let wash = &self.wash;
        for (name, gate) in [
            ("previous_car", wash.previous_car),
            ("car_in_position", wash.car_in_position),
            ("device_ready", wash.device_ready),
            ("confirm", wash.confirm),
        ] {
            if gate.interval.is_zero() || gate.cap.is_zero() {
                return Err(KioskError::Config(format!(
                    "wash.{name} interval and cap must be non-zero"
                )));
            }
        }
        if wash.required_consecutive == 0 || wash.start_rounds == 0 {
            return Err(KioskError::Config(
                "wash.required_consecutive and wash.start_rounds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
