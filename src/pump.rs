//! Watering decisions and pump relay actuation.
//!
//! `decide` is a pure function over the soil-moisture reading, the last
//! successful watering, and the clock. `Pump` drives the relay; the `hardware`
//! feature gates the real rppal driver, without it a mock tracks relay state
//! in memory. An RAII guard owns the "relay open" state so the relay is
//! closed on every exit path, including a cancelled actuation future.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::WateringSettings;

#[cfg(feature = "hardware")]
use anyhow::Result;
#[cfg(feature = "hardware")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WateringTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WateringOutcome {
    Success,
    Skipped(String),
    Failed(String),
}

impl WateringOutcome {
    pub fn describe(&self) -> String {
        match self {
            WateringOutcome::Success => "success".to_string(),
            WateringOutcome::Skipped(reason) => format!("skipped ({reason})"),
            WateringOutcome::Failed(reason) => format!("failed ({reason})"),
        }
    }
}

/// Append-only record of one watering attempt.
#[derive(Debug, Clone, Serialize)]
pub struct WateringEvent {
    pub triggered_at: DateTime<Utc>,
    pub duration_sec: i64,
    pub amount_ml: i64,
    pub trigger: WateringTrigger,
    pub outcome: WateringOutcome,
}

impl WateringEvent {
    /// Event for a watering that never reached the pump.
    pub fn skipped(trigger: WateringTrigger, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            triggered_at: now,
            duration_sec: 0,
            amount_ml: 0,
            trigger,
            outcome: WateringOutcome::Skipped(reason.to_string()),
        }
    }

    /// Event for an attempted actuation that errored out.
    pub fn failed(
        trigger: WateringTrigger,
        cfg: &WateringSettings,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            triggered_at: now,
            duration_sec: cfg.duration_sec,
            amount_ml: 0,
            trigger,
            outcome: WateringOutcome::Failed(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Trigger,
    SkipTooSoon,
    SkipMoistSufficient,
}

impl Decision {
    /// Human-readable skip reason for the event log.
    pub fn reason(&self) -> &'static str {
        match self {
            Decision::Trigger => "triggered",
            Decision::SkipTooSoon => "watering interval not yet elapsed",
            Decision::SkipMoistSufficient => "soil still moist enough",
        }
    }
}

#[derive(Debug, Error)]
pub enum ActuationError {
    #[error("relay fault: {0}")]
    RelayFault(String),
}

// ---------------------------------------------------------------------------
// Decision logic
// ---------------------------------------------------------------------------

/// Decide whether to water.
///
/// `last_watering` must be the last SUCCESSFUL watering; failed attempts do
/// not arm the interval gate (the next cycle re-evaluates from current soil
/// moisture). A manual trigger overrides the moisture check but still
/// honours the minimum interval, so rapid repeated manual calls cannot
/// damage the pump.
pub fn decide(
    trigger: WateringTrigger,
    soil_moisture: i64,
    last_watering: Option<&WateringEvent>,
    now: DateTime<Utc>,
    cfg: &WateringSettings,
) -> Decision {
    if let Some(last) = last_watering {
        // A watering at exactly `interval_hours` ago is eligible again.
        if now - last.triggered_at < Duration::hours(cfg.interval_hours) {
            return Decision::SkipTooSoon;
        }
    }

    if trigger == WateringTrigger::Scheduled {
        let wet_enough = if cfg.low_is_wet {
            soil_moisture < cfg.soil_moisture_threshold
        } else {
            soil_moisture > cfg.soil_moisture_threshold
        };
        if wet_enough {
            return Decision::SkipMoistSufficient;
        }
    }

    Decision::Trigger
}

// ---------------------------------------------------------------------------
// Real GPIO pump (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
pub struct Pump {
    relay: OutputPin,
    active_low: bool,
}

#[cfg(feature = "hardware")]
impl Pump {
    pub fn new(cfg: &WateringSettings) -> Result<Self> {
        let gpio = Gpio::new()?;
        let relay = gpio.get(cfg.relay_gpio_pin)?.into_output();
        let mut pump = Self {
            relay,
            active_low: cfg.relay_active_low,
        };
        // Fail-safe: relay OFF at startup.
        pump.write_relay(false);
        tracing::info!(pin = cfg.relay_gpio_pin, "pump relay initialised");
        Ok(pump)
    }

    fn write_relay(&mut self, on: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on == self.active_low {
            self.relay.set_low();
        } else {
            self.relay.set_high();
        }
    }

    fn set_relay(&mut self, on: bool) -> std::result::Result<(), ActuationError> {
        self.write_relay(on);
        tracing::info!(on, "pump relay set");
        Ok(())
    }

    /// Force the relay closed, ignoring any fault. Shutdown fail-safe.
    pub fn force_off(&mut self) {
        self.write_relay(false);
    }
}

// ---------------------------------------------------------------------------
// Mock pump (development — no hardware, state tracked in memory)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "hardware"))]
pub struct Pump {
    pub(crate) on: bool,
    /// Test hook: the next attempt to open the relay fails with this reason.
    pub(crate) fail_next: Option<String>,
}

#[cfg(not(feature = "hardware"))]
impl Pump {
    pub fn new(cfg: &WateringSettings) -> anyhow::Result<Self> {
        tracing::info!(
            pin = cfg.relay_gpio_pin,
            active_low = cfg.relay_active_low,
            "mock pump relay initialised (no hardware)"
        );
        Ok(Self {
            on: false,
            fail_next: None,
        })
    }

    fn set_relay(&mut self, on: bool) -> std::result::Result<(), ActuationError> {
        if on {
            if let Some(reason) = self.fail_next.take() {
                return Err(ActuationError::RelayFault(reason));
            }
        }
        self.on = on;
        tracing::debug!(on, "mock pump relay set");
        Ok(())
    }

    pub fn force_off(&mut self) {
        self.on = false;
    }
}

// ---------------------------------------------------------------------------
// Actuation
// ---------------------------------------------------------------------------

impl Pump {
    /// Open the relay for `cfg.duration_sec` seconds.
    ///
    /// The relay is guaranteed closed when this returns or when the future
    /// is dropped mid-pulse. Errors are reported, never retried here; the
    /// next scheduled cycle re-evaluates from current soil moisture.
    pub async fn actuate(
        &mut self,
        trigger: WateringTrigger,
        cfg: &WateringSettings,
    ) -> std::result::Result<WateringEvent, ActuationError> {
        let triggered_at = Utc::now();

        let mut guard = RelayGuard::open(self)?;
        tokio::time::sleep(std::time::Duration::from_secs(cfg.duration_sec.max(0) as u64)).await;
        guard.close();

        Ok(WateringEvent {
            triggered_at,
            duration_sec: cfg.duration_sec,
            amount_ml: cfg.amount_ml,
            trigger,
            outcome: WateringOutcome::Success,
        })
    }
}

/// Holds the relay open; closing happens at most once, and `Drop` is the
/// backstop for cancelled futures.
struct RelayGuard<'a> {
    pump: &'a mut Pump,
    open: bool,
}

impl<'a> RelayGuard<'a> {
    fn open(pump: &'a mut Pump) -> std::result::Result<Self, ActuationError> {
        pump.set_relay(true)?;
        Ok(Self { pump, open: true })
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            if self.pump.set_relay(false).is_err() {
                // Closing must not fail the pulse; force the pin as a last resort.
                self.pump.force_off();
            }
        }
    }
}

impl Drop for RelayGuard<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
