//! Age Gate
//!
//! Gates age-restricted content behind a face-based age check: acquire a
//! camera, capture one still frame, ask an age-estimation service for an
//! estimate and grant access exactly when the estimate is at least the
//! required age.
//!
//! # Module Structure
//!
//! - `capture`: capture sources (stub, still file, HTTP snapshot, V4L2) with exclusive device ownership
//! - `frame`: captured JPEG frames, zeroized on drop
//! - `estimate`: age estimation service clients and response parsing
//! - `verify`: the verification state machine and host callbacks
//! - `access`: the decision rule, user-facing messages and the in-memory access log
//! - `catalog`: read-only content catalog supplying required ages
//! - `config`, `ui`, `cli`: the `age_gate` command-line host
//!
//! Frames never leave the process except as the body of one estimation
//! request, and are never logged; logs identify them by fingerprint only.

pub mod access;
pub mod capture;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod estimate;
pub mod frame;
pub mod ui;
pub mod verify;

pub use access::{check_access, decide, AccessLog, AccessRecord, AccessRecorder, AccessResponse, Decision};
pub use capture::{CaptureConstraints, CaptureError, CaptureHandle, CaptureSource, Readiness};
pub use catalog::{Catalog, ContentItem};
pub use config::GateConfig;
pub use estimate::{AgeEstimator, EstimateError, EstimationResult};
pub use frame::CapturedFrame;
pub use verify::{
    AgeOrigin, CallbackObserver, ErrorKind, MachineOptions, TransitionError, VerificationMachine,
    VerificationObserver, VerificationSession, VerificationState,
};
