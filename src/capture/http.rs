//! HTTP snapshot camera source.
//!
//! Network cameras (ESP32-S3 boards, IP webcams) commonly expose a JPEG
//! snapshot endpoint. Acquisition checks the endpoint once; each
//! `capture_frame` fetches a fresh snapshot.
//!
//! HTTP 401/403 maps to `PermissionDenied`; connection failures and other
//! statuses map to `DeviceUnavailable`.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{
    CaptureConstraints, CaptureError, CaptureHandle, CaptureSource, DeviceClaim, DeviceLatch,
    Readiness,
};
use crate::frame::CapturedFrame;

const MAX_JPEG_BYTES: u64 = 5 * 1024 * 1024;
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// JPEG snapshot camera reachable over HTTP(S).
pub struct HttpSnapshotSource {
    url: String,
    agent: ureq::Agent,
    latch: DeviceLatch,
}

impl HttpSnapshotSource {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).context("parse snapshot url")?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported snapshot scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout(SNAPSHOT_TIMEOUT)
            .build();
        Ok(Self {
            url: url.to_string(),
            agent,
            latch: DeviceLatch::default(),
        })
    }
}

impl CaptureSource for HttpSnapshotSource {
    fn name(&self) -> &str {
        &self.url
    }

    fn acquire(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let claim = self.latch.claim(&self.url)?;
        let mut handle = HttpSnapshotHandle {
            claim,
            url: self.url.clone(),
            agent: self.agent.clone(),
            last_error: None,
        };
        // Probe once so permission and reachability failures surface at acquisition.
        handle.fetch_snapshot().map_err(|err| match err {
            CaptureError::NotReady => {
                CaptureError::DeviceUnavailable(format!("{} returned no image", self.url))
            }
            other => other,
        })?;
        log::info!("HttpSnapshotSource: connected to {}", self.url);
        Ok(Box::new(handle))
    }
}

struct HttpSnapshotHandle {
    claim: DeviceClaim,
    url: String,
    agent: ureq::Agent,
    last_error: Option<String>,
}

impl HttpSnapshotHandle {
    fn fetch_snapshot(&mut self) -> Result<CapturedFrame, CaptureError> {
        let result = fetch_single_jpeg(&self.agent, &self.url);
        self.last_error = result.as_ref().err().map(|err| err.to_string());
        result
    }
}

impl CaptureHandle for HttpSnapshotHandle {
    fn readiness(&self) -> Readiness {
        if !self.claim.is_held() {
            Readiness::Unavailable
        } else if self.last_error.is_some() {
            Readiness::Errored
        } else {
            Readiness::Ready
        }
    }

    fn capture_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        if !self.claim.is_held() {
            return Err(CaptureError::DeviceUnavailable(
                "snapshot handle released".to_string(),
            ));
        }
        self.fetch_snapshot()
    }

    fn release(&mut self) {
        if self.claim.clear() {
            log::info!("HttpSnapshotSource: released {}", self.url);
        }
    }
}

impl Drop for HttpSnapshotHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<CapturedFrame, CaptureError> {
    let response = agent.get(url).call().map_err(|err| match err {
        ureq::Error::Status(code @ (401 | 403), _) => {
            CaptureError::PermissionDenied(format!("{url} answered {code}"))
        }
        ureq::Error::Status(code, _) => {
            CaptureError::DeviceUnavailable(format!("{url} answered {code}"))
        }
        ureq::Error::Transport(transport) => {
            CaptureError::DeviceUnavailable(format!("{url}: {transport}"))
        }
    })?;

    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES)
        .read_to_end(&mut bytes)
        .map_err(|err| CaptureError::DeviceUnavailable(format!("read snapshot: {err}")))?;
    if bytes.is_empty() {
        return Err(CaptureError::NotReady);
    }
    CapturedFrame::from_jpeg(bytes)
}
