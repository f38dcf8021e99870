//! Age estimation service clients.
//!
//! The estimation model is an opaque remote collaborator: one still image in,
//! one estimated age out. This module provides:
//! - `HttpAgeEstimator`: multipart or JSON/base64 upload over HTTP
//! - `StubAgeEstimator`: scripted answers, test mode only
//! - `parse_estimation_response`: the response shape contract shared by both

mod http;
mod response;
mod stub;

use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::frame::CapturedFrame;

pub use http::{HttpAgeEstimator, RequestFormat};
pub use response::{parse_estimation_response, AGE_KEYS};
pub use stub::StubAgeEstimator;

/// Value returned by the estimation service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EstimationResult {
    pub estimated_age: u32,
}

/// Failures of one estimation call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EstimateError {
    #[error("estimation service unreachable: {0}")]
    Transport(String),
    #[error("estimation service answered HTTP {0}")]
    Status(u16),
    #[error("malformed estimation response: {0}")]
    Malformed(String),
    #[error("estimation timed out")]
    Timeout,
}

/// Age estimation backend.
///
/// Implementations are called from a worker thread, once per captured frame.
/// They must return (success or error) rather than block indefinitely; the
/// verification machine applies its own deadline regardless.
pub trait AgeEstimator: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &str;

    /// Estimate the age of the face in `frame`.
    fn estimate(&self, frame: &CapturedFrame) -> Result<EstimationResult, EstimateError>;
}

/// Settings used to build an estimator from configuration.
#[derive(Clone, Debug)]
pub struct EstimatorSettings {
    /// `http(s)://…` endpoint, or `stub://<age>` (test mode only).
    pub url: String,
    pub format: RequestFormat,
    pub timeout: Duration,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/predict-age/".to_string(),
            format: RequestFormat::Multipart,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Build an estimator for the configured URL.
///
/// `stub://` estimators fabricate ages and are refused unless `test_mode` is set.
pub fn open_estimator(
    settings: &EstimatorSettings,
    test_mode: bool,
) -> Result<std::sync::Arc<dyn AgeEstimator>> {
    let url = settings.url.trim();
    if let Some(age) = url.strip_prefix("stub://") {
        if !test_mode {
            return Err(anyhow!(
                "stub estimator '{}' is only available in test mode",
                url
            ));
        }
        let age: u32 = age
            .parse()
            .map_err(|_| anyhow!("stub estimator url must be stub://<age>, got '{}'", url))?;
        return Ok(std::sync::Arc::new(StubAgeEstimator::fixed(age)));
    }
    Ok(std::sync::Arc::new(HttpAgeEstimator::new(
        url,
        settings.format,
        settings.timeout,
    )?))
}
