//! V4L2 capture source.
//!
//! Local USB webcams on Linux via libv4l. The device node is opened on
//! `acquire`, streamed through mmap buffers, and closed on release.
//!
//! The V4L2 source MUST NOT:
//! - Store captured frames to disk
//! - Retain frames beyond handoff to the estimator

use std::io::ErrorKind;

use anyhow::{anyhow, Result};
use ouroboros::self_referencing;

use super::{
    CaptureConstraints, CaptureError, CaptureHandle, CaptureSource, DeviceClaim, DeviceLatch,
    Readiness,
};
use crate::frame::CapturedFrame;

/// V4L2 webcam source for `v4l2:///dev/videoN` URLs.
pub struct V4l2CaptureSource {
    name: String,
    device: String,
    latch: DeviceLatch,
}

impl V4l2CaptureSource {
    pub fn new(url: &str) -> Result<Self> {
        let device = url
            .strip_prefix("v4l2://")
            .filter(|path| !path.is_empty())
            .ok_or_else(|| anyhow!("v4l2 url must look like v4l2:///dev/video0"))?;
        Ok(Self {
            name: url.to_string(),
            device: device.to_string(),
            latch: DeviceLatch::default(),
        })
    }
}

#[self_referencing]
struct V4l2Stream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

fn map_io_error(device: &str, err: std::io::Error) -> CaptureError {
    match err.kind() {
        ErrorKind::PermissionDenied => CaptureError::PermissionDenied(format!("{device}: {err}")),
        _ => CaptureError::DeviceUnavailable(format!("{device}: {err}")),
    }
}

impl CaptureSource for V4l2CaptureSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let claim = self.latch.claim(&self.name)?;
        let mut device =
            v4l::Device::with_path(&self.device).map_err(|e| map_io_error(&self.device, e))?;
        let mut format = device
            .format()
            .map_err(|e| map_io_error(&self.device, e))?;
        let (width, height) = constraints.clamped_dimensions();
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2CaptureSource: failed to set format on {}: {}",
                    self.device,
                    err
                );
                device
                    .format()
                    .map_err(|e| map_io_error(&self.device, e))?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} does not offer RGB3 frames",
                self.device
            )));
        }

        let device_name = self.device.clone();
        let stream = V4l2StreamTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|e| map_io_error(&device_name, e))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2CaptureSource: acquired {} ({}x{})",
            self.device,
            format.width,
            format.height
        );
        Ok(Box::new(V4l2CaptureHandle {
            claim,
            device: self.device.clone(),
            stream: Some(stream),
            width: format.width,
            height: format.height,
            frames: 0,
            last_error: None,
        }))
    }
}

struct V4l2CaptureHandle {
    claim: DeviceClaim,
    device: String,
    stream: Option<V4l2Stream>,
    width: u32,
    height: u32,
    frames: u64,
    last_error: Option<String>,
}

impl CaptureHandle for V4l2CaptureHandle {
    fn readiness(&self) -> Readiness {
        if self.stream.is_none() {
            Readiness::Unavailable
        } else if self.last_error.is_some() {
            Readiness::Errored
        } else if self.frames == 0 {
            Readiness::Initializing
        } else {
            Readiness::Ready
        }
    }

    fn capture_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let (width, height) = (self.width, self.height);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::DeviceUnavailable("v4l2 handle released".to_string()))?;
        let result = stream.with_mut(|fields| match fields.stream.next() {
            Ok((buf, _meta)) => CapturedFrame::encode_rgb(buf, width, height),
            Err(err) => Err(CaptureError::DeviceUnavailable(format!(
                "capture v4l2 frame: {err}"
            ))),
        });
        match &result {
            Ok(_) => {
                self.frames += 1;
                self.last_error = None;
            }
            Err(CaptureError::NotReady) => {}
            Err(err) => self.last_error = Some(err.to_string()),
        }
        result
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            log::info!("V4l2CaptureSource: released {}", self.device);
        }
        self.claim.clear();
    }
}

impl Drop for V4l2CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_path() {
        let source = V4l2CaptureSource::new("v4l2:///dev/video0").unwrap();
        assert_eq!(source.device, "/dev/video0");
        assert!(V4l2CaptureSource::new("v4l2://").is_err());
    }
}
