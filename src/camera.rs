//! Daily reference photos: capture, timestamp-named persistence, and the
//! bounded retention sweep.
//!
//! There is no database; the capture directory IS the history. File names
//! embed the capture time (`YYYYMMDD_HHMMSS.jpg`), and both the retention
//! sweep and the startup restore parse that name rather than trusting
//! filesystem metadata, which survives file copies.
//!
//! The `hardware` feature gates a V4L2 camera (MJPG passthrough, so the
//! webcam's own encoder produces the JPEG); without it a mock writes a stub
//! frame.

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

use crate::config::{CameraSettings, StorageSettings};

/// Subdirectory of the storage base path holding all captures.
const CAPTURE_DIR: &str = "plant_images";

/// Capture timestamps resolve to one second; two captures within the same
/// second collide and the second one fails loudly.
const FILE_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

const FILE_EXT: &str = "jpg";

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CaptureRecord {
    pub file_name: String,
    pub captured_at: NaiveDateTime,
    pub path: String,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("frame read failed: {0}")]
    FrameReadFailed(String),
    #[error("storage write failed: {0}")]
    StorageWriteFailed(String),
}

// ---------------------------------------------------------------------------
// File-name round trip
// ---------------------------------------------------------------------------

pub fn file_name_for(ts: NaiveDateTime) -> String {
    format!("{}.{FILE_EXT}", ts.format(FILE_TIME_FORMAT))
}

/// Parse the capture timestamp out of a file name. Returns `None` for
/// anything that is not one of our captures.
pub fn parse_file_name(name: &str) -> Option<NaiveDateTime> {
    let stem = name.strip_suffix(&format!(".{FILE_EXT}"))?;
    NaiveDateTime::parse_from_str(stem, FILE_TIME_FORMAT).ok()
}

// ---------------------------------------------------------------------------
// Capture manager
// ---------------------------------------------------------------------------

pub struct CaptureManager {
    dir: PathBuf,
    camera: CameraSettings,
}

impl CaptureManager {
    pub fn new(storage: &StorageSettings, camera: CameraSettings) -> anyhow::Result<Self> {
        let dir = PathBuf::from(&storage.base_path).join(CAPTURE_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, camera })
    }

    /// Capture one frame and persist it under a timestamp-derived name.
    ///
    /// The camera device is opened per call and released unconditionally,
    /// so a transiently missing camera heals itself on the next attempt.
    pub fn capture_now(&self, now: NaiveDateTime) -> Result<CaptureRecord, CaptureError> {
        let frame = self.read_frame()?;

        let captured_at = now.with_nanosecond(0).unwrap_or(now);
        let file_name = file_name_for(captured_at);
        let path = self.dir.join(&file_name);

        // create_new: a same-second collision fails loudly instead of
        // silently overwriting an existing capture.
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| CaptureError::StorageWriteFailed(format!("{}: {e}", path.display())))?;
        file.write_all(&frame)
            .map_err(|e| CaptureError::StorageWriteFailed(format!("{}: {e}", path.display())))?;

        Ok(CaptureRecord {
            file_name,
            captured_at,
            path: path.display().to_string(),
        })
    }

    /// Delete captures older than the retention window, judged by the
    /// timestamp embedded in each file name. Returns the number deleted.
    /// Files whose names don't parse are not ours and are left alone.
    pub fn prune_old_captures(&self, now: NaiveDateTime) -> usize {
        let cutoff = now - Duration::days(self.camera.retention_days);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("retention sweep: cannot list {}: {e}", self.dir.display());
                return 0;
            }
        };

        let mut deleted = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(ts) = parse_file_name(&name.to_string_lossy()) else {
                continue;
            };
            if ts < cutoff {
                match fs::remove_file(entry.path()) {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("retention sweep: cannot delete {:?}: {e}", name),
                }
            }
        }
        deleted
    }

    /// Newest capture on disk, reconstructed from the directory listing.
    /// Seeds `last_capture` and the daily double-fire guard after a restart.
    pub fn latest_capture(&self) -> Option<CaptureRecord> {
        let entries = fs::read_dir(&self.dir).ok()?;

        let mut newest: Option<CaptureRecord> = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(ts) = parse_file_name(&name) else {
                continue;
            };
            if newest.as_ref().map_or(true, |r| ts > r.captured_at) {
                newest = Some(CaptureRecord {
                    file_name: name,
                    captured_at: ts,
                    path: entry.path().display().to_string(),
                });
            }
        }
        newest
    }
}

// ---------------------------------------------------------------------------
// Frame acquisition (V4L2 — requires the `hardware` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
impl CaptureManager {
    fn read_frame(&self) -> Result<Vec<u8>, CaptureError> {
        use v4l::buffer::Type;
        use v4l::io::traits::CaptureStream;
        use v4l::prelude::*;
        use v4l::video::Capture;
        use v4l::FourCC;

        let dev = Device::new(self.camera.device_index)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let mut fmt = dev
            .format()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        fmt.width = self.camera.width;
        fmt.height = self.camera.height;
        fmt.fourcc = FourCC::new(b"MJPG");
        dev.set_format(&fmt)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let mut stream = MmapStream::with_buffers(&dev, Type::VideoCapture, 2)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        // The first frame is a warm-up exposure; discard it.
        stream
            .next()
            .map_err(|e| CaptureError::FrameReadFailed(e.to_string()))?;
        let (buf, _meta) = stream
            .next()
            .map_err(|e| CaptureError::FrameReadFailed(e.to_string()))?;

        Ok(buf.to_vec())
        // dev and stream drop here: the device is released even when an
        // earlier `?` already returned.
    }
}

// ---------------------------------------------------------------------------
// Frame acquisition (mock — no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "hardware"))]
impl CaptureManager {
    fn read_frame(&self) -> Result<Vec<u8>, CaptureError> {
        tracing::debug!(
            device = self.camera.device_index,
            "mock frame generated (no hardware)"
        );

        // Stub JPEG: SOI, a comment segment naming the mock resolution, EOI.
        let comment = format!(
            "mock frame {}x{}",
            self.camera.width, self.camera.height
        )
        .into_bytes();

        let mut frame = vec![0xFF, 0xD8];
        frame.extend([0xFF, 0xFE]);
        frame.extend(((comment.len() + 2) as u16).to_be_bytes());
        frame.extend(&comment);
        frame.extend([0xFF, 0xD9]);
        Ok(frame)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
