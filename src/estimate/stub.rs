use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{AgeEstimator, EstimateError, EstimationResult};
use crate::frame::CapturedFrame;

/// Scripted estimator for tests and test-mode demos.
///
/// Answers are served in order; the last answer repeats once the script is
/// exhausted. An optional delay simulates a slow service.
pub struct StubAgeEstimator {
    script: Mutex<VecDeque<Result<u32, EstimateError>>>,
    delay: Duration,
    calls: AtomicU64,
}

impl StubAgeEstimator {
    pub fn fixed(age: u32) -> Self {
        Self::scripted(vec![Ok(age)])
    }

    pub fn failing(error: EstimateError) -> Self {
        Self::scripted(vec![Err(error)])
    }

    pub fn scripted(answers: Vec<Result<u32, EstimateError>>) -> Self {
        Self {
            script: Mutex::new(answers.into()),
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgeEstimator for StubAgeEstimator {
    fn name(&self) -> &str {
        "stub"
    }

    fn estimate(&self, frame: &CapturedFrame) -> Result<EstimationResult, EstimateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        log::debug!("StubAgeEstimator: frame {}", frame.fingerprint());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let answer = {
            let mut script = self
                .script
                .lock()
                .map_err(|_| EstimateError::Transport("stub script lock poisoned".to_string()))?;
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match answer {
            Some(Ok(estimated_age)) => Ok(EstimationResult { estimated_age }),
            Some(Err(err)) => Err(err),
            None => Err(EstimateError::Malformed("stub has no scripted answer".to_string())),
        }
    }
}
