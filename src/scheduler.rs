//! Supervisor: three independently-clocked periodic tasks sharing one
//! process, plus the manual request paths used by the web layer.
//!
//! ```text
//! SoilMoistureTask ──every soil_moisture_interval──▶ read → decide → actuate
//! ClimateTask ──────every climate_interval─────────▶ read → merge state
//! CaptureTask ──────daily at auto_capture_time─────▶ capture → prune
//! ```
//!
//! The pump relay and the camera are exclusive resources, each behind its
//! own `tokio::sync::Mutex` held only for the hardware operation. Sensor
//! bus transactions share a third mutex and may overlap actuation or
//! capture. Manual requests wait briefly for the resource lock and report
//! `Busy` instead of blocking indefinitely. Every task failure is logged,
//! recorded into shared state, and answered by the task's next tick;
//! there are no other retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::camera::{CaptureError, CaptureManager, CaptureRecord};
use crate::config::Settings;
use crate::pump::{self, Decision, Pump, WateringEvent, WateringTrigger};
use crate::sensor::SensorReader;
use crate::state::SharedState;

/// How long a manual request waits for the pump or camera before giving up.
const MANUAL_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Manual request results
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ManualWateringResult {
    /// The pump is in use by another operation.
    Busy,
    /// The request was evaluated; the event says whether water flowed,
    /// the interval gate skipped it, or the relay faulted.
    Event(WateringEvent),
}

#[derive(Debug)]
pub enum ManualCaptureResult {
    /// The camera is in use by another operation.
    Busy,
    Done(CaptureRecord),
    Failed(CaptureError),
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    settings: Settings,
    capture_time: NaiveTime,
    state: SharedState,
    sensors: Mutex<SensorReader>,
    pump: Mutex<Pump>,
    camera: Mutex<CaptureManager>,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        state: SharedState,
        sensors: SensorReader,
        pump: Pump,
        camera: CaptureManager,
    ) -> anyhow::Result<Arc<Self>> {
        let capture_time = settings.camera.capture_time()?;
        Ok(Arc::new(Self {
            settings,
            capture_time,
            state,
            sensors: Mutex::new(sensors),
            pump: Mutex::new(pump),
            camera: Mutex::new(camera),
        }))
    }

    /// Spawn the three periodic tasks. Each loop owns its own ticker, so a
    /// task can never overlap itself.
    pub fn spawn_tasks(self: &Arc<Self>) {
        let soil = Arc::clone(self);
        tokio::spawn(async move { soil.soil_moisture_task().await });

        let climate = Arc::clone(self);
        tokio::spawn(async move { climate.climate_task().await });

        let capture = Arc::clone(self);
        tokio::spawn(async move { capture.capture_task().await });

        info!(
            soil_sec = self.settings.tasks.soil_moisture_interval_sec,
            climate_sec = self.settings.tasks.climate_interval_sec,
            capture_at = %self.capture_time,
            "supervisor tasks started"
        );
    }

    /// Wait for any in-flight hardware operation to finish, then force the
    /// relay off. Called once on shutdown; an in-flight watering or capture
    /// is never abandoned mid-actuation.
    pub async fn shutdown(&self) {
        let mut pump = self.pump.lock().await;
        let _camera = self.camera.lock().await;
        pump.force_off();
        self.state
            .write()
            .await
            .record_system("shutdown: hardware in safe state".to_string());
        info!("shutdown: hardware in safe state");
    }

    // -- Soil moisture / watering ------------------------------------------

    async fn soil_moisture_task(&self) {
        let mut ticker = interval(Duration::from_secs(
            self.settings.tasks.soil_moisture_interval_sec,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the first real
        // check happens one full interval after startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.run_soil_cycle().await;
        }
    }

    async fn run_soil_cycle(&self) {
        let moisture = {
            let mut sensors = self.sensors.lock().await;
            match sensors.read_soil_moisture().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("soil moisture read failed: {e}");
                    let mut st = self.state.write().await;
                    st.record_error(format!("soil moisture read failed: {e}"));
                    return;
                }
            }
        };

        let last_watering = {
            let mut st = self.state.write().await;
            st.record_soil_moisture(moisture);
            st.last_watering.clone()
        };

        let now = Utc::now();
        let decision = pump::decide(
            WateringTrigger::Scheduled,
            moisture,
            last_watering.as_ref(),
            now,
            &self.settings.watering,
        );
        match decision {
            Decision::SkipMoistSufficient => {
                debug!(moisture, "soil moist enough, no watering");
                return;
            }
            Decision::SkipTooSoon => {
                // Dry soil held back only by the interval gate is worth a
                // visible log entry.
                debug!(moisture, "soil dry but watering interval not elapsed");
                let event =
                    WateringEvent::skipped(WateringTrigger::Scheduled, decision.reason(), now);
                self.state.write().await.record_watering(event);
                return;
            }
            Decision::Trigger => {}
        }

        // Take the pump and re-evaluate under the lock; a manual watering
        // may have slipped in since the check above.
        let mut pump = self.pump.lock().await;
        let event = self
            .water(WateringTrigger::Scheduled, moisture, &mut pump)
            .await;
        drop(pump);
        self.state.write().await.record_watering(event);
    }

    /// Decide and (when due) actuate. Caller holds the pump lock, which
    /// makes the decide-actuate pair atomic with respect to other waterers.
    async fn water(
        &self,
        trigger: WateringTrigger,
        moisture: i64,
        pump: &mut Pump,
    ) -> WateringEvent {
        let now = Utc::now();
        let last_watering = self.state.read().await.last_watering.clone();

        let decision = pump::decide(
            trigger,
            moisture,
            last_watering.as_ref(),
            now,
            &self.settings.watering,
        );
        match decision {
            Decision::Trigger => {
                info!(?trigger, moisture, "starting watering pulse");
                match pump.actuate(trigger, &self.settings.watering).await {
                    Ok(event) => event,
                    Err(e) => {
                        error!("pump actuation failed: {e}");
                        WateringEvent::failed(trigger, &self.settings.watering, &e.to_string(), now)
                    }
                }
            }
            skip => WateringEvent::skipped(trigger, skip.reason(), now),
        }
    }

    /// Manual watering: overrides the moisture check, still honours the
    /// minimum interval, and reports `Busy` if the pump is held elsewhere.
    pub async fn manual_watering(&self) -> ManualWateringResult {
        let Ok(mut pump) = timeout(MANUAL_LOCK_TIMEOUT, self.pump.lock()).await else {
            return ManualWateringResult::Busy;
        };

        // The manual path ignores moisture; pass the last known value for
        // the log's sake.
        let moisture = {
            let st = self.state.read().await;
            st.last_reading
                .as_ref()
                .and_then(|r| r.soil_moisture)
                .unwrap_or(0)
        };

        let event = self.water(WateringTrigger::Manual, moisture, &mut pump).await;
        drop(pump);
        self.state.write().await.record_watering(event.clone());
        ManualWateringResult::Event(event)
    }

    // -- Climate -----------------------------------------------------------

    async fn climate_task(&self) {
        let mut ticker = interval(Duration::from_secs(
            self.settings.tasks.climate_interval_sec,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let result = {
                let mut sensors = self.sensors.lock().await;
                sensors.read_climate().await
            };
            let mut st = self.state.write().await;
            match result {
                Ok((temperature, humidity)) => st.record_climate(temperature, humidity),
                Err(e) => {
                    warn!("climate read failed: {e}");
                    st.record_error(format!("climate read failed: {e}"));
                }
            }
        }
    }

    // -- Daily capture -----------------------------------------------------

    async fn capture_task(&self) {
        // The capture directory is the history: seed the double-fire guard
        // from the newest on-disk image.
        let mut last_fired = {
            let st = self.state.read().await;
            initial_fired_day(st.last_capture.as_ref(), self.capture_time)
        };

        loop {
            let now = Local::now().naive_local();
            let fire_at = next_capture_fire(now, self.capture_time, last_fired);
            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            debug!(fire_at = %fire_at, "next scheduled capture");
            tokio::time::sleep(wait).await;

            let day = Local::now().date_naive();
            self.run_capture_cycle().await;
            last_fired = Some(day);
        }
    }

    async fn run_capture_cycle(&self) {
        let outcome = {
            let camera = self.camera.lock().await;
            capture_and_prune(&camera)
        };
        let mut st = self.state.write().await;
        match outcome {
            Ok((record, pruned)) => {
                info!(file = %record.file_name, pruned, "scheduled capture done");
                st.record_capture(record, pruned);
            }
            Err(e) => {
                error!("scheduled capture failed: {e}");
                st.record_error(format!("scheduled capture failed: {e}"));
            }
        }
    }

    /// Manual capture: same camera path as the daily task, `Busy` if the
    /// camera is held elsewhere.
    pub async fn manual_capture(&self) -> ManualCaptureResult {
        let Ok(camera) = timeout(MANUAL_LOCK_TIMEOUT, self.camera.lock()).await else {
            return ManualCaptureResult::Busy;
        };

        let outcome = capture_and_prune(&camera);
        drop(camera);

        let mut st = self.state.write().await;
        match outcome {
            Ok((record, pruned)) => {
                info!(file = %record.file_name, pruned, "manual capture done");
                st.record_capture(record.clone(), pruned);
                ManualCaptureResult::Done(record)
            }
            Err(e) => {
                warn!("manual capture failed: {e}");
                st.record_error(format!("manual capture failed: {e}"));
                ManualCaptureResult::Failed(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn capture_and_prune(camera: &CaptureManager) -> Result<(CaptureRecord, usize), CaptureError> {
    let now = Local::now().naive_local();
    let record = camera.capture_now(now)?;
    // Coupling the sweep to capture activity bounds directory growth to one
    // retention window plus one capture interval, with no extra timer.
    let pruned = camera.prune_old_captures(now);
    Ok((record, pruned))
}

/// When should the daily capture fire next?
///
/// Today's target if it is still ahead and nothing fired today; right now
/// if today's target passed unfired (catch-up after downtime); otherwise
/// tomorrow's target.
fn next_capture_fire(
    now: NaiveDateTime,
    target: NaiveTime,
    last_fired: Option<NaiveDate>,
) -> NaiveDateTime {
    let today = now.date();
    let today_target = today.and_time(target);

    if last_fired != Some(today) {
        if now <= today_target {
            return today_target;
        }
        return now;
    }
    today
        .succ_opt()
        .map(|d| d.and_time(target))
        .unwrap_or(today_target)
}

/// Which day, if any, counts as already-fired at startup. A restart shortly
/// after the daily shot must not fire again, while an early-morning manual
/// capture must not suppress the scheduled one.
fn initial_fired_day(last: Option<&CaptureRecord>, target: NaiveTime) -> Option<NaiveDate> {
    let record = last?;
    if record.captured_at.time() >= target {
        Some(record.captured_at.date())
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
