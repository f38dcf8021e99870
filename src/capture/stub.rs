//! Stub capture source.
//!
//! Produces synthetic frames for `stub://` URLs, demos and tests. It behaves
//! like a real device where the verification machine can observe it:
//! - only one handle may be live at a time ("already in use")
//! - permission and availability can be toggled to exercise acquisition failures
//! - frames are not decodable until a warm-up period has elapsed

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    CaptureConstraints, CaptureError, CaptureHandle, CaptureSource, DeviceClaim, DeviceLatch,
    Readiness,
};
use crate::frame::{rgb_buffer_len, CapturedFrame};

/// Configuration for a stub source.
#[derive(Clone, Debug)]
pub struct StubCaptureConfig {
    pub name: String,
    /// Delay before `acquire` returns (simulates the permission prompt).
    pub acquire_delay: Duration,
    /// Time after acquisition before the first decodable frame.
    pub warm_up: Duration,
}

impl Default for StubCaptureConfig {
    fn default() -> Self {
        Self {
            name: "stub://front_camera".to_string(),
            acquire_delay: Duration::ZERO,
            warm_up: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct StubCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    frames: AtomicU64,
}

/// Synthetic capture device.
#[derive(Debug)]
pub struct StubCaptureSource {
    config: StubCaptureConfig,
    latch: DeviceLatch,
    permission_denied: AtomicBool,
    unavailable: AtomicBool,
    counters: Arc<StubCounters>,
}

impl StubCaptureSource {
    pub fn new(config: StubCaptureConfig) -> Self {
        Self {
            config,
            latch: DeviceLatch::default(),
            permission_denied: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            counters: Arc::new(StubCounters::default()),
        }
    }

    /// Make subsequent `acquire` calls fail with `PermissionDenied`.
    pub fn set_permission_denied(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    /// Make subsequent `acquire` calls fail with `DeviceUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// True while a handle holds the device.
    pub fn is_in_use(&self) -> bool {
        self.latch.is_claimed()
    }

    pub fn acquire_count(&self) -> u64 {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn frames_captured(&self) -> u64 {
        self.counters.frames.load(Ordering::SeqCst)
    }
}

impl Default for StubCaptureSource {
    fn default() -> Self {
        Self::new(StubCaptureConfig::default())
    }
}

impl CaptureSource for StubCaptureSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        if !self.config.acquire_delay.is_zero() {
            std::thread::sleep(self.config.acquire_delay);
        }
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied(format!(
                "{} refused by user",
                self.config.name
            )));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} not present",
                self.config.name
            )));
        }

        let claim = self.latch.claim(&self.config.name)?;
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        let (width, height) = constraints.clamped_dimensions();
        log::info!(
            "StubCaptureSource: acquired {} ({}x{}, {:?})",
            self.config.name,
            width,
            height,
            constraints.facing
        );

        Ok(Box::new(StubCaptureHandle {
            claim,
            counters: self.counters.clone(),
            width,
            height,
            ready_at: Instant::now() + self.config.warm_up,
            frame_count: 0,
        }))
    }
}

struct StubCaptureHandle {
    claim: DeviceClaim,
    counters: Arc<StubCounters>,
    width: u32,
    height: u32,
    ready_at: Instant,
    frame_count: u64,
}

impl StubCaptureHandle {
    /// Moving gradient; each frame differs from the last.
    fn generate_synthetic_pixels(&self) -> Result<Vec<u8>, CaptureError> {
        let len = rgb_buffer_len(self.width, self.height).ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!(
                "stub frame {}x{} is too large",
                self.width, self.height
            ))
        })?;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        Ok(pixels)
    }
}

impl CaptureHandle for StubCaptureHandle {
    fn readiness(&self) -> Readiness {
        if !self.claim.is_held() {
            Readiness::Unavailable
        } else if Instant::now() < self.ready_at {
            Readiness::Initializing
        } else {
            Readiness::Ready
        }
    }

    fn capture_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        match self.readiness() {
            Readiness::Ready => {}
            Readiness::Initializing => return Err(CaptureError::NotReady),
            _ => {
                return Err(CaptureError::DeviceUnavailable(
                    "stub handle released".to_string(),
                ))
            }
        }
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels()?;
        let frame = CapturedFrame::encode_rgb(&pixels, self.width, self.height)?;
        self.counters.frames.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn release(&mut self) {
        if self.claim.clear() {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
            log::info!("StubCaptureSource: released");
        }
    }
}

impl Drop for StubCaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> CaptureConstraints {
        CaptureConstraints {
            ideal_width: 64,
            ideal_height: 48,
            ..CaptureConstraints::default()
        }
    }

    #[test]
    fn stub_source_produces_frames() {
        let source = StubCaptureSource::default();
        let mut handle = source.acquire(&small()).unwrap();
        assert_eq!(handle.readiness(), Readiness::Ready);

        let frame = handle.capture_frame().unwrap();
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(source.frames_captured(), 1);
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let source = StubCaptureSource::default();
        let mut handle = source.acquire(&small()).unwrap();
        let err = source.acquire(&small()).err().unwrap();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));

        handle.release();
        handle.release();
        assert_eq!(source.release_count(), 1);
        assert!(source.acquire(&small()).is_ok());
    }

    #[test]
    fn oversized_constraints_are_clamped() {
        let source = StubCaptureSource::default();
        let huge = CaptureConstraints {
            ideal_width: 40_000,
            ideal_height: 40_000,
            ..CaptureConstraints::default()
        };
        let max = crate::capture::MAX_FRAME_DIMENSION;
        assert_eq!(huge.clamped_dimensions(), (max, max));
        assert!(source.acquire(&huge).is_ok());
        assert_eq!(rgb_buffer_len(u32::MAX, u32::MAX), None);
        assert_eq!(rgb_buffer_len(4, 2), Some(24));
    }

    #[test]
    fn drop_releases_device() {
        let source = StubCaptureSource::default();
        drop(source.acquire(&small()).unwrap());
        assert!(!source.is_in_use());
        assert_eq!(source.release_count(), 1);
    }

    #[test]
    fn permission_denied_is_reported() {
        let source = StubCaptureSource::default();
        source.set_permission_denied(true);
        assert!(matches!(
            source.acquire(&small()).err().unwrap(),
            CaptureError::PermissionDenied(_)
        ));
        assert!(!source.is_in_use());
    }

    #[test]
    fn frames_not_ready_during_warm_up() {
        let source = StubCaptureSource::new(StubCaptureConfig {
            warm_up: Duration::from_secs(60),
            ..StubCaptureConfig::default()
        });
        let mut handle = source.acquire(&small()).unwrap();
        assert_eq!(handle.readiness(), Readiness::Initializing);
        assert!(matches!(
            handle.capture_frame(),
            Err(CaptureError::NotReady)
        ));
    }

    #[test]
    fn released_handle_cannot_capture() {
        let source = StubCaptureSource::default();
        let mut handle = source.acquire(&small()).unwrap();
        handle.release();
        assert_eq!(handle.readiness(), Readiness::Unavailable);
        assert!(handle.capture_frame().is_err());
    }
}
