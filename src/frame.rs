//! Captured still frames.
//!
//! A `CapturedFrame` is the only thing that leaves a capture handle. It owns the
//! encoded JPEG bytes of one snapshot and is handed, by value, to the age
//! estimator for a single request.
//!
//! - Not `Clone`: a frame is uploaded once and then dropped.
//! - Bytes are zeroized on drop to limit the exposure window of face images.
//! - Logs identify frames by `fingerprint()`, never by content.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::capture::CaptureError;

/// JPEG quality used for snapshots sent to the estimator.
pub const JPEG_QUALITY: u8 = 80;

/// Content type of every encoded frame.
pub const FRAME_CONTENT_TYPE: &str = "image/jpeg";

/// Encoded still image captured from a live source.
pub struct CapturedFrame {
    /// Encoded JPEG. Private: read through `as_jpeg()` only.
    jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

// Explicitly NOT implementing Clone.

impl CapturedFrame {
    /// Encode tightly packed RGB8 pixels into a JPEG still.
    ///
    /// Zero dimensions mean the source has not decoded a frame yet and map to
    /// `CaptureError::NotReady`.
    pub fn encode_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::NotReady);
        }
        let expected = rgb_buffer_len(width, height).ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!("frame {width}x{height} is too large"))
        })?;
        if pixels.len() < expected {
            return Err(CaptureError::NotReady);
        }

        let mut jpeg = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
            .encode(&pixels[..expected], width, height, ExtendedColorType::Rgb8)
            .map_err(|err| CaptureError::DeviceUnavailable(format!("jpeg encode failed: {err}")))?;

        Ok(Self {
            jpeg,
            width,
            height,
        })
    }

    /// Wrap an already encoded image, checking that it decodes to a non-empty frame.
    pub fn from_jpeg(bytes: Vec<u8>) -> Result<Self, CaptureError> {
        let mut bytes = bytes;
        let dims = image::load_from_memory(&bytes)
            .map(|img| (img.width(), img.height()))
            .ok();
        match dims {
            Some((width, height)) if width > 0 && height > 0 => Ok(Self {
                jpeg: bytes,
                width,
                height,
            }),
            _ => {
                bytes.zeroize();
                Err(CaptureError::NotReady)
            }
        }
    }

    /// Encoded bytes for upload.
    pub fn as_jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn byte_len(&self) -> usize {
        self.jpeg.len()
    }

    /// Short SHA-256 fingerprint for log correlation.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.jpeg);
        hex::encode(&digest[..6])
    }
}

/// Byte length of a packed RGB8 buffer; `None` if it does not fit in memory.
pub fn rgb_buffer_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(3)
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.jpeg.len())
            .finish()
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        self.jpeg.zeroize();
    }
}
