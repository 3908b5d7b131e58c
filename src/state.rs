//! Shared controller state: the latest sensor reading, watering event, and
//! capture record, plus a bounded event log. The supervisor tasks are the
//! only writers; the web layer reads immutable snapshots via `to_status`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::camera::CaptureRecord;
use crate::pump::{WateringEvent, WateringOutcome};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<ControllerState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct ControllerState {
    pub started_at: Instant,
    pub last_reading: Option<SensorReading>,
    /// Most recent watering that actually dispensed water. Skips and
    /// failures only show up in `events`; they never arm the interval gate.
    pub last_watering: Option<WateringEvent>,
    pub last_capture: Option<CaptureRecord>,
    pub events: VecDeque<SystemEvent>,
}

/// Merged view of the two sensor groups. The soil and climate tasks run on
/// different cadences, so each merge replaces the whole record with a new
/// one carrying the other group's previous values.
#[derive(Clone, Serialize)]
pub struct SensorReading {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub soil_moisture: Option<i64>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Watering,
    Capture,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub version: &'static str,
    pub last_reading: Option<SensorReading>,
    pub last_watering: Option<WateringEvent>,
    pub last_capture: Option<CaptureRecord>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl ControllerState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_reading: None,
            last_watering: None,
            last_capture: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Merge a fresh soil-moisture value into the latest reading.
    pub fn record_soil_moisture(&mut self, raw: i64) {
        let prev = self.last_reading.take();
        self.last_reading = Some(SensorReading {
            temperature: prev.as_ref().and_then(|r| r.temperature),
            humidity: prev.as_ref().and_then(|r| r.humidity),
            soil_moisture: Some(raw),
            taken_at: Utc::now(),
        });
        self.push_event(EventKind::Reading, format!("soil_moisture={raw}"));
    }

    /// Merge fresh temperature/humidity values into the latest reading.
    pub fn record_climate(&mut self, temperature: f32, humidity: f32) {
        let prev = self.last_reading.take();
        self.last_reading = Some(SensorReading {
            temperature: Some(temperature),
            humidity: Some(humidity),
            soil_moisture: prev.as_ref().and_then(|r| r.soil_moisture),
            taken_at: Utc::now(),
        });
        self.push_event(
            EventKind::Reading,
            format!("temperature={temperature:.1} humidity={humidity:.1}"),
        );
    }

    /// Record the outcome of a watering attempt. Only a `Success` becomes
    /// the new `last_watering`.
    pub fn record_watering(&mut self, event: WateringEvent) {
        let detail = format!(
            "{:?} watering: {}",
            event.trigger,
            event.outcome.describe()
        );
        match event.outcome {
            WateringOutcome::Success => {
                self.push_event(EventKind::Watering, detail);
                self.last_watering = Some(event);
            }
            WateringOutcome::Skipped(_) => {
                self.push_event(EventKind::Watering, detail);
            }
            WateringOutcome::Failed(_) => {
                self.push_event(EventKind::Error, detail);
            }
        }
    }

    /// Record a successful capture and how many old images the retention
    /// sweep removed afterwards.
    pub fn record_capture(&mut self, record: CaptureRecord, pruned: usize) {
        self.push_event(
            EventKind::Capture,
            format!("captured {} ({pruned} pruned)", record.file_name),
        );
        self.last_capture = Some(record);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
            last_reading: self.last_reading.clone(),
            last_watering: self.last_watering.clone(),
            last_capture: self.last_capture.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::{WateringEvent, WateringOutcome, WateringTrigger};

    fn event(outcome: WateringOutcome) -> WateringEvent {
        WateringEvent {
            triggered_at: Utc::now(),
            duration_sec: 5,
            amount_ml: 100,
            trigger: WateringTrigger::Scheduled,
            outcome,
        }
    }

    // -- Reading merge -----------------------------------------------------

    #[test]
    fn soil_then_climate_preserves_soil() {
        let mut st = ControllerState::new();
        st.record_soil_moisture(180);
        st.record_climate(25.5, 60.0);

        let r = st.last_reading.as_ref().unwrap();
        assert_eq!(r.soil_moisture, Some(180));
        assert_eq!(r.temperature, Some(25.5));
        assert_eq!(r.humidity, Some(60.0));
    }

    #[test]
    fn climate_then_soil_preserves_climate() {
        let mut st = ControllerState::new();
        st.record_climate(22.0, 55.0);
        st.record_soil_moisture(140);

        let r = st.last_reading.as_ref().unwrap();
        assert_eq!(r.soil_moisture, Some(140));
        assert_eq!(r.temperature, Some(22.0));
    }

    #[test]
    fn first_soil_reading_has_no_climate() {
        let mut st = ControllerState::new();
        st.record_soil_moisture(170);

        let r = st.last_reading.as_ref().unwrap();
        assert!(r.temperature.is_none());
        assert!(r.humidity.is_none());
    }

    // -- Watering outcomes -------------------------------------------------

    #[test]
    fn success_becomes_last_watering() {
        let mut st = ControllerState::new();
        st.record_watering(event(WateringOutcome::Success));
        assert!(st.last_watering.is_some());
    }

    #[test]
    fn skip_does_not_touch_last_watering() {
        let mut st = ControllerState::new();
        st.record_watering(event(WateringOutcome::Skipped("too soon".into())));
        assert!(st.last_watering.is_none());
        assert_eq!(st.events.len(), 1);
    }

    #[test]
    fn failure_is_logged_but_does_not_arm_gate() {
        let mut st = ControllerState::new();
        st.record_watering(event(WateringOutcome::Success));
        let armed_at = st.last_watering.as_ref().unwrap().triggered_at;

        st.record_watering(event(WateringOutcome::Failed("relay fault".into())));
        assert_eq!(st.last_watering.as_ref().unwrap().triggered_at, armed_at);
        assert!(matches!(
            st.events.back().unwrap().kind,
            EventKind::Error
        ));
    }

    // -- Ring buffer -------------------------------------------------------

    #[test]
    fn event_buffer_is_bounded() {
        let mut st = ControllerState::new();
        for i in 0..500 {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.back().unwrap().detail, "event 499");
    }

    // -- Snapshot ----------------------------------------------------------

    #[test]
    fn status_carries_version_and_newest_first_events() {
        let mut st = ControllerState::new();
        st.record_system("first".into());
        st.record_system("second".into());

        let status = st.to_status();
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[1].detail, "first");
    }
}
