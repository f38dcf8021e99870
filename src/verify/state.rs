use std::fmt;

use serde::Serialize;

use crate::capture::CaptureError;
use crate::estimate::EstimateError;

/// Why a session ended in `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    NotReady,
    ServiceError,
    Timeout,
}

impl ErrorKind {
    /// Failures raised by the capture device rather than the estimation service.
    pub fn is_capture(self) -> bool {
        matches!(
            self,
            ErrorKind::PermissionDenied | ErrorKind::DeviceUnavailable | ErrorKind::NotReady
        )
    }
}

impl From<&CaptureError> for ErrorKind {
    fn from(err: &CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CaptureError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            CaptureError::NotReady => ErrorKind::NotReady,
        }
    }
}

impl From<&EstimateError> for ErrorKind {
    fn from(err: &EstimateError) -> Self {
        match err {
            EstimateError::Timeout => ErrorKind::Timeout,
            EstimateError::Transport(_) | EstimateError::Status(_) | EstimateError::Malformed(_) => {
                ErrorKind::ServiceError
            }
        }
    }
}

/// Where a detected age came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AgeOrigin {
    /// Returned by the estimation service for a captured frame.
    Estimated,
    /// Injected through the test-mode affordance.
    Simulated,
}

/// State of the current verification session.
///
/// The detected age exists only in `Granted`/`Denied` and the error only in
/// `Failed`, so neither can be observed in any other state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum VerificationState {
    Idle,
    AwaitingSource,
    Ready,
    Capturing,
    Estimating,
    Granted { detected_age: u32 },
    Denied { detected_age: u32 },
    Failed { error: ErrorKind },
}

impl VerificationState {
    pub fn name(&self) -> &'static str {
        match self {
            VerificationState::Idle => "idle",
            VerificationState::AwaitingSource => "awaiting_source",
            VerificationState::Ready => "ready",
            VerificationState::Capturing => "capturing",
            VerificationState::Estimating => "estimating",
            VerificationState::Granted { .. } => "granted",
            VerificationState::Denied { .. } => "denied",
            VerificationState::Failed { .. } => "failed",
        }
    }

    pub fn detected_age(&self) -> Option<u32> {
        match self {
            VerificationState::Granted { detected_age }
            | VerificationState::Denied { detected_age } => Some(*detected_age),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            VerificationState::Failed { error } => Some(*error),
            _ => None,
        }
    }

    /// `Granted`, `Denied` or `Failed`: only `retry` or `close` leave these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationState::Granted { .. }
                | VerificationState::Denied { .. }
                | VerificationState::Failed { .. }
        )
    }

    /// Waiting on a device or service completion.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            VerificationState::AwaitingSource
                | VerificationState::Capturing
                | VerificationState::Estimating
        )
    }

    /// Transition table.
    pub fn allows(&self, next: &VerificationState) -> bool {
        use VerificationState::*;
        match (self, next) {
            (_, Idle) => true,
            (Idle, AwaitingSource) => true,
            (AwaitingSource, Ready | Failed { .. }) => true,
            // Ready -> Estimating is the test-mode age injection.
            (Ready, Capturing | Estimating) => true,
            (Capturing, Estimating | Failed { .. }) => true,
            (Estimating, Granted { .. } | Denied { .. } | Failed { .. }) => true,
            (Granted { .. } | Denied { .. } | Failed { .. }, Ready | AwaitingSource) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationState::Granted { detected_age } => write!(f, "granted({detected_age})"),
            VerificationState::Denied { detected_age } => write!(f, "denied({detected_age})"),
            VerificationState::Failed { error } => write!(f, "failed({error:?})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One verification attempt from `open` to close.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationSession {
    pub(super) id: u64,
    pub(super) attempt: u32,
    pub(super) required_age: u32,
    pub(super) state: VerificationState,
    pub(super) origin: Option<AgeOrigin>,
}

impl VerificationSession {
    pub(super) fn idle() -> Self {
        Self {
            id: 0,
            attempt: 0,
            required_age: 0,
            state: VerificationState::Idle,
            origin: None,
        }
    }

    pub(super) fn opened(id: u64, required_age: u32) -> Self {
        Self {
            id,
            attempt: 1,
            required_age,
            state: VerificationState::Idle,
            origin: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 1 for the first attempt, incremented by each `retry`.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn required_age(&self) -> u32 {
        self.required_age
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn detected_age(&self) -> Option<u32> {
        self.state.detected_age()
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.state.error()
    }

    /// Origin of the detected age; `None` unless a decision was reached.
    pub fn origin(&self) -> Option<AgeOrigin> {
        self.origin
    }
}

/// Contract violations reported to the integrating code. State is unchanged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("{operation} is not valid in state {state}")]
    InvalidTransition {
        operation: &'static str,
        state: VerificationState,
    },
    #[error("required age must be non-negative, got {0}")]
    NegativeRequiredAge(i64),
    #[error("simulated ages are disabled outside test mode")]
    TestModeDisabled,
}

/// Convert a signed host value into a required age, rejecting negatives.
pub fn required_age_from_signed(value: i64) -> Result<u32, TransitionError> {
    u32::try_from(value).map_err(|_| TransitionError::NegativeRequiredAge(value))
}
