//! TOML settings loading and validation.
//!
//! Settings are read once at startup and treated as immutable for the
//! process lifetime. Every section has defaults, so an empty file (or a
//! missing optional key) yields a runnable development configuration.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Settings structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tasks: TaskSettings,
    pub watering: WateringSettings,
    pub sensor: SensorSettings,
    pub camera: CameraSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Seconds between soil-moisture checks (each check may trigger watering).
    pub soil_moisture_interval_sec: u64,
    /// Seconds between temperature/humidity checks.
    pub climate_interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WateringSettings {
    /// Raw soil-moisture value at which the plant counts as dry.
    pub soil_moisture_threshold: i64,
    /// Sensor polarity: `true` means a LOWER raw value is WETTER soil.
    /// Device-specific; calibrate before trusting automatic watering.
    pub low_is_wet: bool,
    /// Minimum hours between two waterings, scheduled or manual.
    pub interval_hours: i64,
    /// How long the pump relay stays open per watering.
    pub duration_sec: i64,
    /// Approximate volume dispensed per watering, for the event log.
    pub amount_ml: i64,
    /// BCM pin driving the pump relay.
    pub relay_gpio_pin: u8,
    /// Many common relay boards are active-low.
    pub relay_active_low: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// I2C address of the ADS1115 carrying the soil-moisture probe.
    pub ads1115_addr: u16,
    /// ADS1115 single-ended input the probe is wired to (0-3).
    pub ads1115_channel: usize,
    /// I2C address of the SHT3x temperature/humidity sensor.
    pub sht3x_addr: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    /// Wall-clock time of the daily reference photo, "HH:MM".
    pub auto_capture_time: String,
    /// Images older than this are deleted by the retention sweep.
    pub retention_days: i64,
    /// V4L2 device index (0 = /dev/video0).
    pub device_index: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base directory for persisted data; captures land in
    /// `<base_path>/plant_images/`.
    pub base_path: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            soil_moisture_interval_sec: 300,
            climate_interval_sec: 1800,
        }
    }
}

impl Default for WateringSettings {
    fn default() -> Self {
        Self {
            soil_moisture_threshold: 159,
            low_is_wet: true,
            interval_hours: 12,
            duration_sec: 5,
            amount_ml: 100,
            relay_gpio_pin: 17,
            relay_active_low: true,
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            ads1115_addr: 0x48,
            ads1115_channel: 0,
            sht3x_addr: 0x44,
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            auto_capture_time: "06:00".to_string(),
            retention_days: 90,
            device_index: 0,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_path: "./data".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const ADS1115_MAX: i64 = 32767;

/// Maximum valid ADS1115 channel index for single-ended reads.
const ADS1115_MAX_CHANNEL: usize = 3;

/// Hard ceiling on a single pump pulse. A stuck 5-minute pulse already
/// empties a small reservoir; anything longer is a config typo.
const MAX_PUMP_SEC: i64 = 300;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all settings. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.tasks.soil_moisture_interval_sec == 0 {
            errors.push("tasks: soil_moisture_interval_sec must be positive".into());
        }
        if self.tasks.climate_interval_sec == 0 {
            errors.push("tasks: climate_interval_sec must be positive".into());
        }

        let w = &self.watering;
        if !(0..=ADS1115_MAX).contains(&w.soil_moisture_threshold) {
            errors.push(format!(
                "watering: soil_moisture_threshold {} out of ADC range [0, {ADS1115_MAX}]",
                w.soil_moisture_threshold
            ));
        }
        if w.interval_hours <= 0 {
            errors.push(format!(
                "watering: interval_hours must be positive, got {}",
                w.interval_hours
            ));
        }
        if w.duration_sec <= 0 {
            errors.push(format!(
                "watering: duration_sec must be positive, got {}",
                w.duration_sec
            ));
        } else if w.duration_sec > MAX_PUMP_SEC {
            errors.push(format!(
                "watering: duration_sec {} exceeds maximum {MAX_PUMP_SEC}",
                w.duration_sec
            ));
        }
        if w.amount_ml <= 0 {
            errors.push(format!(
                "watering: amount_ml must be positive, got {}",
                w.amount_ml
            ));
        }
        if !VALID_GPIO_PINS.contains(&w.relay_gpio_pin) {
            errors.push(format!(
                "watering: relay_gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                w.relay_gpio_pin
            ));
        }

        if self.sensor.ads1115_channel > ADS1115_MAX_CHANNEL {
            errors.push(format!(
                "sensor: ads1115_channel {} out of range (0-{ADS1115_MAX_CHANNEL})",
                self.sensor.ads1115_channel
            ));
        }

        let c = &self.camera;
        if c.width == 0 || c.height == 0 {
            errors.push(format!(
                "camera: resolution {}x{} must be non-zero",
                c.width, c.height
            ));
        }
        if NaiveTime::parse_from_str(&c.auto_capture_time, "%H:%M").is_err() {
            errors.push(format!(
                "camera: auto_capture_time '{}' is not HH:MM",
                c.auto_capture_time
            ));
        }
        if c.retention_days <= 0 {
            errors.push(format!(
                "camera: retention_days must be positive, got {}",
                c.retention_days
            ));
        }

        if self.storage.base_path.trim().is_empty() {
            errors.push("storage: base_path is empty".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

impl CameraSettings {
    /// Parse the daily capture time. Only fails before `validate` has run.
    pub fn capture_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.auto_capture_time, "%H:%M")
            .with_context(|| format!("bad auto_capture_time '{}'", self.auto_capture_time))
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file.
pub fn load(path: &str) -> Result<Settings> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    settings
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Defaults ----------------------------------------------------------

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.tasks.soil_moisture_interval_sec, 300);
        assert_eq!(s.tasks.climate_interval_sec, 1800);
        assert_eq!(s.watering.soil_moisture_threshold, 159);
        assert!(s.watering.low_is_wet);
        assert_eq!(s.watering.interval_hours, 12);
        assert_eq!(s.watering.duration_sec, 5);
        assert_eq!(s.watering.amount_ml, 100);
        assert_eq!(s.camera.width, 1280);
        assert_eq!(s.camera.height, 720);
        assert_eq!(s.camera.auto_capture_time, "06:00");
        assert_eq!(s.camera.retention_days, 90);
    }

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let s: Settings = toml::from_str("").unwrap();
        assert_eq!(s.watering.soil_moisture_threshold, 159);
        assert_eq!(s.storage.base_path, "./data");
    }

    // -- Parsing -----------------------------------------------------------

    #[test]
    fn parses_full_file() {
        let s: Settings = toml::from_str(
            r#"
            [tasks]
            soil_moisture_interval_sec = 60
            climate_interval_sec = 600

            [watering]
            soil_moisture_threshold = 200
            low_is_wet = false
            interval_hours = 6
            duration_sec = 10
            amount_ml = 250
            relay_gpio_pin = 27
            relay_active_low = false

            [camera]
            width = 640
            height = 480
            auto_capture_time = "07:30"
            retention_days = 30
            device_index = 1

            [storage]
            base_path = "/mnt/usb-storage"
            "#,
        )
        .unwrap();

        assert_eq!(s.tasks.soil_moisture_interval_sec, 60);
        assert_eq!(s.watering.soil_moisture_threshold, 200);
        assert!(!s.watering.low_is_wet);
        assert_eq!(s.camera.auto_capture_time, "07:30");
        assert_eq!(s.storage.base_path, "/mnt/usb-storage");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let s: Settings = toml::from_str("[watering]\nsoil_moisture_threshold = 300\n").unwrap();
        assert_eq!(s.watering.soil_moisture_threshold, 300);
        assert_eq!(s.watering.interval_hours, 12);
    }

    // -- Validation --------------------------------------------------------

    #[test]
    fn zero_interval_rejected() {
        let mut s = Settings::default();
        s.tasks.soil_moisture_interval_sec = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn bad_capture_time_rejected() {
        let mut s = Settings::default();
        s.camera.auto_capture_time = "6 o'clock".into();
        let err = s.validate().unwrap_err().to_string();
        assert!(err.contains("auto_capture_time"), "got: {err}");
    }

    #[test]
    fn capture_time_parses_hhmm() {
        let s = Settings::default();
        let t = s.camera.capture_time().unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
    }

    #[test]
    fn invalid_gpio_pin_rejected() {
        let mut s = Settings::default();
        s.watering.relay_gpio_pin = 1; // reserved for ID EEPROM
        assert!(s.validate().is_err());
    }

    #[test]
    fn threshold_out_of_adc_range_rejected() {
        let mut s = Settings::default();
        s.watering.soil_moisture_threshold = 40000;
        assert!(s.validate().is_err());
    }

    #[test]
    fn overlong_pump_pulse_rejected() {
        let mut s = Settings::default();
        s.watering.duration_sec = 3600;
        let err = s.validate().unwrap_err().to_string();
        assert!(err.contains("duration_sec"), "got: {err}");
    }

    #[test]
    fn validation_collects_all_errors() {
        let mut s = Settings::default();
        s.tasks.climate_interval_sec = 0;
        s.watering.interval_hours = -1;
        s.camera.retention_days = 0;
        let err = s.validate().unwrap_err().to_string();
        assert!(err.contains("3 errors"), "got: {err}");
    }

    #[test]
    fn bad_ads_channel_rejected() {
        let mut s = Settings::default();
        s.sensor.ads1115_channel = 4;
        assert!(s.validate().is_err());
    }
}
