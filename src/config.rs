use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{CaptureSettings, Facing, MAX_FRAME_DIMENSION};
use crate::estimate::{EstimatorSettings, RequestFormat};
use crate::verify::MachineOptions;

const DEFAULT_CAPTURE_URL: &str = "stub://front_camera";
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_FRAME_WAIT_MS: u64 = 2_000;
const DEFAULT_ESTIMATOR_URL: &str = "http://localhost:8000/predict-age/";
const DEFAULT_ESTIMATOR_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REQUIRED_AGE: u32 = 18;

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    capture: Option<CaptureConfigFile>,
    estimator: Option<EstimatorConfigFile>,
    catalog_path: Option<PathBuf>,
    test_mode: Option<bool>,
    default_required_age: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    facing: Option<String>,
    frame_wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EstimatorConfigFile {
    url: Option<String>,
    format: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub capture: CaptureSettings,
    pub estimator: EstimatorSettings,
    /// JSON catalog; the built-in demo catalog is used when unset.
    pub catalog_path: Option<PathBuf>,
    /// Enables simulated ages and `stub://` estimators. Off by default.
    pub test_mode: bool,
    pub default_required_age: u32,
}

impl GateConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AGE_GATE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GateConfigFile) -> Result<Self> {
        let capture_file = file.capture.unwrap_or_default();
        let facing = match capture_file.facing.as_deref() {
            Some(value) => Facing::parse(value)?,
            None => Facing::default(),
        };
        let capture = CaptureSettings {
            url: capture_file
                .url
                .unwrap_or_else(|| DEFAULT_CAPTURE_URL.to_string()),
            width: capture_file.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
            height: capture_file.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
            facing,
            frame_wait: Duration::from_millis(
                capture_file.frame_wait_ms.unwrap_or(DEFAULT_FRAME_WAIT_MS),
            ),
        };

        let estimator_file = file.estimator.unwrap_or_default();
        let format = match estimator_file.format.as_deref() {
            Some(value) => RequestFormat::parse(value)?,
            None => RequestFormat::default(),
        };
        let estimator = EstimatorSettings {
            url: estimator_file
                .url
                .unwrap_or_else(|| DEFAULT_ESTIMATOR_URL.to_string()),
            format,
            timeout: Duration::from_millis(
                estimator_file
                    .timeout_ms
                    .unwrap_or(DEFAULT_ESTIMATOR_TIMEOUT_MS),
            ),
        };

        Ok(Self {
            capture,
            estimator,
            catalog_path: file.catalog_path,
            test_mode: file.test_mode.unwrap_or(false),
            default_required_age: file.default_required_age.unwrap_or(DEFAULT_REQUIRED_AGE),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("AGE_GATE_CAPTURE_URL") {
            if !url.trim().is_empty() {
                self.capture.url = url;
            }
        }
        if let Ok(url) = std::env::var("AGE_GATE_ESTIMATOR_URL") {
            if !url.trim().is_empty() {
                self.estimator.url = url;
            }
        }
        if let Ok(format) = std::env::var("AGE_GATE_ESTIMATOR_FORMAT") {
            if !format.trim().is_empty() {
                self.estimator.format = RequestFormat::parse(&format)?;
            }
        }
        if let Ok(timeout) = std::env::var("AGE_GATE_ESTIMATOR_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("AGE_GATE_ESTIMATOR_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.estimator.timeout = Duration::from_millis(millis);
        }
        if let Ok(path) = std::env::var("AGE_GATE_CATALOG") {
            if !path.trim().is_empty() {
                self.catalog_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(flag) = std::env::var("AGE_GATE_TEST_MODE") {
            self.test_mode = parse_flag(&flag)
                .ok_or_else(|| anyhow!("AGE_GATE_TEST_MODE must be true/false, got '{}'", flag))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.capture.url = self.capture.url.trim().to_string();
        self.estimator.url = self.estimator.url.trim().to_string();

        if self.capture.url.is_empty() {
            return Err(anyhow!("capture url must not be empty"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!(
                "capture dimensions must be greater than zero (got {}x{})",
                self.capture.width,
                self.capture.height
            ));
        }
        if self.capture.width > MAX_FRAME_DIMENSION || self.capture.height > MAX_FRAME_DIMENSION {
            return Err(anyhow!(
                "capture dimensions must be at most {} (got {}x{})",
                MAX_FRAME_DIMENSION,
                self.capture.width,
                self.capture.height
            ));
        }
        if self.estimator.timeout.is_zero() {
            return Err(anyhow!("estimator timeout must be greater than zero"));
        }
        if self.estimator.url.starts_with("stub://") && !self.test_mode {
            return Err(anyhow!(
                "stub estimator '{}' requires test_mode",
                self.estimator.url
            ));
        }
        Ok(())
    }

    /// Machine tunables derived from this configuration.
    pub fn machine_options(&self) -> MachineOptions {
        MachineOptions {
            constraints: self.capture.constraints(),
            estimate_timeout: self.estimator.timeout,
            frame_wait: self.capture.frame_wait,
            test_mode: self.test_mode,
            ..MachineOptions::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<GateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
