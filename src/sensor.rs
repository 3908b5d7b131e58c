//! Environmental sensor reads over the I2C bus.
//!
//! Soil moisture comes from an ADS1115 16-bit ADC (single-shot, single-ended,
//! PGA ±4.096 V, 128 SPS) carrying a capacitive probe; temperature and
//! humidity from an SHT3x. One bus transaction per call and no internal
//! retries; the retry policy is the supervisor's next scheduled tick. The
//! bus is opened per call, so a transiently absent device heals itself.
//!
//! The `hardware` feature gates the real rppal drivers; without it a mock
//! returns plausible values.

use thiserror::Error;

use crate::config::SensorSettings;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor unavailable: {0}")]
    Unavailable(String),
    #[error("sensor read timed out")]
    Timeout,
    #[error("invalid reading: {0}")]
    InvalidReading(String),
}

// ---------------------------------------------------------------------------
// Physical ranges (wiring-fault detection)
// ---------------------------------------------------------------------------

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const SOIL_RAW_MAX: i64 = 32767;

/// SHT3x operating range per datasheet.
const TEMP_RANGE_C: std::ops::RangeInclusive<f32> = -40.0..=125.0;
const HUMIDITY_RANGE: std::ops::RangeInclusive<f32> = 0.0..=100.0;

fn validate_soil(raw: i64) -> Result<i64, SensorError> {
    if (0..=SOIL_RAW_MAX).contains(&raw) {
        Ok(raw)
    } else {
        Err(SensorError::InvalidReading(format!(
            "soil moisture {raw} outside 0..={SOIL_RAW_MAX}"
        )))
    }
}

fn validate_climate(temperature: f32, humidity: f32) -> Result<(f32, f32), SensorError> {
    if !TEMP_RANGE_C.contains(&temperature) {
        return Err(SensorError::InvalidReading(format!(
            "temperature {temperature} °C outside sensor range"
        )));
    }
    if !HUMIDITY_RANGE.contains(&humidity) {
        return Err(SensorError::InvalidReading(format!(
            "humidity {humidity} % outside sensor range"
        )));
    }
    Ok((temperature, humidity))
}

// ---------------------------------------------------------------------------
// SHT3x conversion
// ---------------------------------------------------------------------------

#[cfg(any(feature = "hardware", test))]
fn convert_temperature(raw: u16) -> f32 {
    -45.0 + 175.0 * (raw as f32) / 65535.0
}

#[cfg(any(feature = "hardware", test))]
fn convert_humidity(raw: u16) -> f32 {
    100.0 * (raw as f32) / 65535.0
}

/// CRC-8 as used by the SHT3x: polynomial 0x31, init 0xFF, over each
/// two-byte word.
#[cfg(any(feature = "hardware", test))]
fn sht3x_crc(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ---------------------------------------------------------------------------
// Real I2C reader (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
mod ads1115 {
    //! Register layout for the ADS1115 single-shot configuration.
    //
    // Config register, MSB first:
    //   [15]    OS       — write 1 to start single-shot conversion
    //   [14:12] MUX      — input multiplexer (channel selection)
    //   [11:9]  PGA      — programmable gain amplifier
    //   [8]     MODE     — 0 = continuous, 1 = single-shot
    //   [7:5]   DR       — data rate
    //   [1:0]   COMP_QUE — 11 = disable comparator

    pub const REG_CONVERSION: u8 = 0x00;
    pub const REG_CONFIG: u8 = 0x01;

    /// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
    /// DR=100 (128 SPS), comparator off.
    pub const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

    /// MUX values for single-ended reads (AINx vs GND).
    pub const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];
    pub const MUX_SHIFT: u8 = 12;

    /// Bit 15 of the config register reads back as conversion-ready.
    pub const OS_READY_BIT: u16 = 1 << 15;

    pub fn config_for_channel(channel: usize) -> u16 {
        CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
    }
}

#[cfg(feature = "hardware")]
pub struct SensorReader {
    cfg: SensorSettings,
}

#[cfg(feature = "hardware")]
impl SensorReader {
    pub fn new(cfg: SensorSettings) -> Self {
        tracing::info!(
            ads1115_addr = format_args!("0x{:02x}", cfg.ads1115_addr),
            channel = cfg.ads1115_channel,
            sht3x_addr = format_args!("0x{:02x}", cfg.sht3x_addr),
            "i2c sensors configured"
        );
        Self { cfg }
    }

    fn open_bus(&self, addr: u16) -> Result<rppal::i2c::I2c, SensorError> {
        let mut i2c =
            rppal::i2c::I2c::new().map_err(|e| SensorError::Unavailable(e.to_string()))?;
        i2c.set_slave_address(addr)
            .map_err(|e| SensorError::Unavailable(e.to_string()))?;
        Ok(i2c)
    }

    /// Single-shot soil-moisture read, raw ADC units.
    pub async fn read_soil_moisture(&mut self) -> Result<i64, SensorError> {
        use ads1115::*;

        let mut i2c = self.open_bus(self.cfg.ads1115_addr)?;
        let config = config_for_channel(self.cfg.ads1115_channel);
        i2c.block_write(REG_CONFIG, &config.to_be_bytes())
            .map_err(|e| SensorError::Unavailable(e.to_string()))?;

        // Conversion takes ~7.8 ms at 128 SPS; poll the ready bit briefly
        // after the nominal wait.
        tokio::time::sleep(std::time::Duration::from_millis(9)).await;

        let mut ready = false;
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            i2c.block_read(REG_CONFIG, &mut buf)
                .map_err(|e| SensorError::Unavailable(e.to_string()))?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                ready = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        if !ready {
            return Err(SensorError::Timeout);
        }

        let mut buf = [0u8; 2];
        i2c.block_read(REG_CONVERSION, &mut buf)
            .map_err(|e| SensorError::Unavailable(e.to_string()))?;
        validate_soil(i16::from_be_bytes(buf) as i64)
    }

    /// High-repeatability SHT3x measurement: (°C, %RH).
    pub async fn read_climate(&mut self) -> Result<(f32, f32), SensorError> {
        let mut i2c = self.open_bus(self.cfg.sht3x_addr)?;

        // Measurement command, high repeatability, no clock stretching.
        i2c.write(&[0x24, 0x00])
            .map_err(|e| SensorError::Unavailable(e.to_string()))?;
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;

        // The sensor NACKs reads until the measurement is done; a failure
        // here means it never finished within the bounded window.
        let mut buf = [0u8; 6];
        i2c.read(&mut buf).map_err(|_| SensorError::Timeout)?;

        if sht3x_crc(&buf[0..2]) != buf[2] || sht3x_crc(&buf[3..5]) != buf[5] {
            return Err(SensorError::InvalidReading("checksum mismatch".into()));
        }

        let temperature = convert_temperature(u16::from_be_bytes([buf[0], buf[1]]));
        let humidity = convert_humidity(u16::from_be_bytes([buf[3], buf[4]]));
        validate_climate(temperature, humidity)
    }
}

// ---------------------------------------------------------------------------
// Mock reader (development — no hardware, plausible random values)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "hardware"))]
pub struct SensorReader;

#[cfg(not(feature = "hardware"))]
impl SensorReader {
    pub fn new(cfg: SensorSettings) -> Self {
        tracing::info!(
            ads1115_addr = format_args!("0x{:02x}", cfg.ads1115_addr),
            channel = cfg.ads1115_channel,
            sht3x_addr = format_args!("0x{:02x}", cfg.sht3x_addr),
            "mock sensors initialised (no hardware)"
        );
        Self
    }

    pub async fn read_soil_moisture(&mut self) -> Result<i64, SensorError> {
        use rand::Rng;
        let raw = rand::thread_rng().gen_range(120..=220);
        tracing::debug!(raw, "mock soil moisture read");
        validate_soil(raw)
    }

    pub async fn read_climate(&mut self) -> Result<(f32, f32), SensorError> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let temperature = rng.gen_range(20.0..28.0);
        let humidity = rng.gen_range(40.0..70.0);
        tracing::debug!(temperature, humidity, "mock climate read");
        validate_climate(temperature, humidity)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Range validation --------------------------------------------------

    #[test]
    fn soil_in_range_passes() {
        assert_eq!(validate_soil(0).unwrap(), 0);
        assert_eq!(validate_soil(159).unwrap(), 159);
        assert_eq!(validate_soil(32767).unwrap(), 32767);
    }

    #[test]
    fn soil_out_of_range_is_invalid_reading() {
        assert!(matches!(
            validate_soil(-1),
            Err(SensorError::InvalidReading(_))
        ));
        assert!(matches!(
            validate_soil(40000),
            Err(SensorError::InvalidReading(_))
        ));
    }

    #[test]
    fn climate_out_of_range_is_invalid_reading() {
        assert!(validate_climate(25.0, 60.0).is_ok());
        assert!(matches!(
            validate_climate(-60.0, 50.0),
            Err(SensorError::InvalidReading(_))
        ));
        assert!(matches!(
            validate_climate(25.0, 130.0),
            Err(SensorError::InvalidReading(_))
        ));
    }

    // -- SHT3x conversion --------------------------------------------------

    #[test]
    fn temperature_conversion_endpoints() {
        assert!((convert_temperature(0) - -45.0).abs() < 0.01);
        assert!((convert_temperature(0x6666) - 25.0).abs() < 0.01);
    }

    #[test]
    fn humidity_conversion_endpoints() {
        assert!((convert_humidity(0) - 0.0).abs() < 0.01);
        assert!((convert_humidity(0xFFFF) - 100.0).abs() < 0.01);
    }

    #[test]
    fn crc_matches_datasheet_example() {
        // SHT3x datasheet: CRC of 0xBEEF is 0x92.
        assert_eq!(sht3x_crc(&[0xBE, 0xEF]), 0x92);
    }

    // -- Mock reader -------------------------------------------------------

    #[tokio::test]
    async fn mock_readings_are_plausible() {
        let mut reader = SensorReader::new(crate::config::SensorSettings::default());

        let soil = reader.read_soil_moisture().await.unwrap();
        assert!((120..=220).contains(&soil));

        let (t, h) = reader.read_climate().await.unwrap();
        assert!((20.0..28.0).contains(&t));
        assert!((40.0..70.0).contains(&h));
    }
}
