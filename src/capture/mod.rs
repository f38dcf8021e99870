//! Capture sources.
//!
//! This module abstracts over the camera / media-input device so the
//! verification machine never deals with device APIs directly:
//! - Stub source (`stub://`), synthetic frames for demos and tests
//! - Still-image files (local path or `file://`)
//! - HTTP snapshot cameras (`http(s)://`)
//! - USB/V4L2 devices (`v4l2://`, feature: capture-v4l2)
//!
//! A source hands out at most one live `CaptureHandle` at a time. The handle
//! owns the device until `release()` is called or the handle is dropped.
//!
//! The capture layer MUST NOT:
//! - Store frames to disk
//! - Log frame content

pub mod file;
pub mod http;
pub mod stub;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::frame::CapturedFrame;

pub use file::FileCaptureSource;
pub use http::HttpSnapshotSource;
pub use stub::{StubCaptureConfig, StubCaptureSource};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2CaptureSource;

/// Failures raised by capture sources and handles.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("no decodable frame yet")]
    NotReady,
}

/// Readiness of a capture device as seen by its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Unavailable,
    Initializing,
    Ready,
    Errored,
}

/// Camera facing preference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Facing {
    #[default]
    User,
    Environment,
}

impl Facing {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "front" => Ok(Facing::User),
            "environment" | "back" | "rear" => Ok(Facing::Environment),
            other => Err(anyhow!(
                "unknown facing '{}'; expected user or environment",
                other
            )),
        }
    }
}

/// Largest width or height a source will produce.
pub const MAX_FRAME_DIMENSION: u32 = 8192;

/// Hints passed to `acquire`. Sources treat width/height as ideals, not requirements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing: Facing,
}

impl CaptureConstraints {
    /// Ideal dimensions limited to `1..=MAX_FRAME_DIMENSION`.
    pub fn clamped_dimensions(&self) -> (u32, u32) {
        (
            self.ideal_width.clamp(1, MAX_FRAME_DIMENSION),
            self.ideal_height.clamp(1, MAX_FRAME_DIMENSION),
        )
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
            facing: Facing::User,
        }
    }
}

/// A device that can be acquired for live capture.
pub trait CaptureSource: Send + Sync {
    /// Source identifier for logs.
    fn name(&self) -> &str;

    /// Request a live video input. The device indicator is active until the
    /// returned handle is released.
    fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// Exclusive ownership of an acquired device.
///
/// Implementations MUST release the device on `Drop` if `release` was not called.
pub trait CaptureHandle: Send {
    fn readiness(&self) -> Readiness;

    /// Snapshot the current frame into an encoded still.
    fn capture_frame(&mut self) -> Result<CapturedFrame, CaptureError>;

    /// Stop all underlying device tracks. Idempotent.
    fn release(&mut self);
}

/// Settings used to build a source from configuration.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Source URL: `stub://name`, `file:///path` or a plain path, `http(s)://…`, `v4l2:///dev/videoN`.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub facing: Facing,
    /// How long frame capture keeps retrying while the device has no decodable frame.
    pub frame_wait: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            url: "stub://front_camera".to_string(),
            width: 640,
            height: 480,
            facing: Facing::User,
            frame_wait: Duration::from_secs(2),
        }
    }
}

impl CaptureSettings {
    pub fn constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            ideal_width: self.width,
            ideal_height: self.height,
            facing: self.facing,
        }
    }
}

/// Build a capture source for the configured URL scheme.
pub fn open_source(settings: &CaptureSettings) -> Result<Arc<dyn CaptureSource>> {
    let url = settings.url.trim();
    if url.starts_with("stub://") {
        return Ok(Arc::new(StubCaptureSource::new(StubCaptureConfig {
            name: url.to_string(),
            ..StubCaptureConfig::default()
        })));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Arc::new(HttpSnapshotSource::new(url)?));
    }
    if url.starts_with("v4l2://") {
        #[cfg(feature = "capture-v4l2")]
        {
            return Ok(Arc::new(V4l2CaptureSource::new(url)?));
        }
        #[cfg(not(feature = "capture-v4l2"))]
        {
            return Err(anyhow!("v4l2 capture requires the capture-v4l2 feature"));
        }
    }
    if url.contains("://") && !url.starts_with("file://") {
        return Err(anyhow!("unsupported capture url '{}'", url));
    }
    Ok(Arc::new(FileCaptureSource::new(url)?))
}

/// Exclusive-use latch shared between a source and the handle it hands out.
///
/// `claim` fails while a handle is live; the handle clears it on release.
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceLatch {
    in_use: Arc<AtomicBool>,
}

impl DeviceLatch {
    pub(crate) fn claim(&self, device: &str) -> Result<DeviceClaim, CaptureError> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{device} already in use"
            )));
        }
        Ok(DeviceClaim {
            in_use: Some(self.in_use.clone()),
        })
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Held by a live handle. Clearing is idempotent and also happens on drop.
#[derive(Debug)]
pub(crate) struct DeviceClaim {
    in_use: Option<Arc<AtomicBool>>,
}

impl DeviceClaim {
    /// Returns true the first time only.
    pub(crate) fn clear(&mut self) -> bool {
        match self.in_use.take() {
            Some(flag) => {
                flag.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.in_use.is_some()
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.clear();
    }
}
