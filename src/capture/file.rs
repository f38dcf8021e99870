//! Still-image file capture source.
//!
//! Serves a local JPEG as if it were a camera that always shows the same
//! picture. Useful for kiosks without a camera and for replaying a known
//! selfie against an estimator.
//!
//! The file source MUST NOT:
//! - Fetch remote URLs
//! - Write anything back to disk

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use zeroize::Zeroize;

use super::{
    CaptureConstraints, CaptureError, CaptureHandle, CaptureSource, DeviceClaim, DeviceLatch,
    Readiness,
};
use crate::frame::CapturedFrame;

/// Local still-image source.
#[derive(Debug)]
pub struct FileCaptureSource {
    name: String,
    path: PathBuf,
    latch: DeviceLatch,
}

impl FileCaptureSource {
    /// Accepts a plain local path or a `file://` URL.
    pub fn new(location: &str) -> Result<Self> {
        let path = if location.starts_with("file://") {
            let url = url::Url::parse(location)
                .map_err(|e| anyhow!("invalid file url '{}': {}", location, e))?;
            url.to_file_path()
                .map_err(|_| anyhow!("file url '{}' is not a local path", location))?
        } else {
            PathBuf::from(location)
        };
        if path.as_os_str().is_empty() {
            return Err(anyhow!("file capture source requires a path"));
        }
        Ok(Self {
            name: location.to_string(),
            path,
            latch: DeviceLatch::default(),
        })
    }
}

impl CaptureSource for FileCaptureSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let claim = self.latch.claim(&self.name)?;
        let bytes = std::fs::read(&self.path).map_err(|err| match err.kind() {
            ErrorKind::PermissionDenied => {
                CaptureError::PermissionDenied(format!("{}: {}", self.path.display(), err))
            }
            _ => CaptureError::DeviceUnavailable(format!("{}: {}", self.path.display(), err)),
        })?;
        log::info!(
            "FileCaptureSource: opened {} ({} bytes)",
            self.path.display(),
            bytes.len()
        );
        Ok(Box::new(FileCaptureHandle {
            claim,
            bytes: Some(bytes),
        }))
    }
}

struct FileCaptureHandle {
    claim: DeviceClaim,
    bytes: Option<Vec<u8>>,
}

impl CaptureHandle for FileCaptureHandle {
    fn readiness(&self) -> Readiness {
        match &self.bytes {
            Some(bytes) if !bytes.is_empty() => Readiness::Ready,
            Some(_) => Readiness::Errored,
            None => Readiness::Unavailable,
        }
    }

    fn capture_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        let bytes = self
            .bytes
            .as_ref()
            .ok_or_else(|| CaptureError::DeviceUnavailable("file handle released".to_string()))?;
        CapturedFrame::from_jpeg(bytes.clone())
    }

    fn release(&mut self) {
        if let Some(mut bytes) = self.bytes.take() {
            bytes.zeroize();
        }
        self.claim.clear();
    }
}

impl Drop for FileCaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}
