//! Access decisions and the in-memory access log.
//!
//! `decide` is the only authorization rule in the crate: access is granted
//! exactly when the detected age is at least the required age.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::catalog::ContentItem;
use crate::verify::{AgeOrigin, VerificationObserver, VerificationSession, VerificationState};

/// Outcome of comparing a detected age against a requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Decision {
    Granted,
    Denied,
}

/// Non-strict comparison: a tie grants access.
pub fn decide(detected_age: u32, required_age: u32) -> Decision {
    if detected_age >= required_age {
        Decision::Granted
    } else {
        Decision::Denied
    }
}

/// Host-facing answer for one content item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessResponse {
    pub granted: bool,
    pub message: String,
    pub item: ContentItem,
}

/// User-facing text for a decision.
pub fn access_message(decision: Decision, required_age: u32, detected_age: u32) -> String {
    match decision {
        Decision::Granted => "Access granted. Enjoy the movie!".to_string(),
        Decision::Denied => format!(
            "Access denied. This content requires minimum age {}, detected age: {}",
            required_age, detected_age
        ),
    }
}

/// Evaluate a detected age against an item's rating.
pub fn check_access(item: &ContentItem, detected_age: u32) -> AccessResponse {
    let decision = decide(detected_age, item.age_rating);
    AccessResponse {
        granted: decision == Decision::Granted,
        message: access_message(decision, item.age_rating, detected_age),
        item: item.clone(),
    }
}

// -------------------- Time Buckets --------------------

const TEN_MINUTES_S: u32 = 600;

/// Coarse time bucket; access records never carry precise timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TimeBucket {
    /// start of bucket in seconds since epoch (coarse)
    pub start_epoch_s: u64,
    /// bucket size in seconds (e.g., 600 = 10 minutes)
    pub size_s: u32,
}

impl TimeBucket {
    pub fn now(bucket_size_s: u32) -> Result<Self> {
        if bucket_size_s == 0 {
            return Err(anyhow!("time bucket size must be > 0"));
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let size = bucket_size_s as u64;
        Ok(TimeBucket {
            start_epoch_s: (now / size) * size,
            size_s: bucket_size_s,
        })
    }

    pub fn now_10min() -> Result<Self> {
        Self::now(TEN_MINUTES_S)
    }
}

// -------------------- Access Log --------------------

/// One decided verification attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessRecord {
    pub item_id: Option<String>,
    pub detected_age: u32,
    pub required_age: u32,
    pub granted: bool,
    pub denial_reason: Option<String>,
    pub origin: AgeOrigin,
    pub time_bucket: Option<TimeBucket>,
}

/// Shared, in-memory list of access records. Nothing is persisted.
#[derive(Clone, Debug, Default)]
pub struct AccessLog {
    records: Arc<Mutex<Vec<AccessRecord>>>,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: AccessRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow!("access log lock poisoned"))?
            .push(record);
        Ok(())
    }

    pub fn records(&self) -> Vec<AccessRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Observer that appends every decision to an `AccessLog`.
pub struct AccessRecorder {
    log: AccessLog,
    item_id: Option<String>,
}

impl AccessRecorder {
    pub fn new(log: AccessLog, item_id: Option<String>) -> Self {
        Self { log, item_id }
    }
}

impl VerificationObserver for AccessRecorder {
    fn on_granted(&mut self, _detected_age: u32) {}

    fn on_denied(&mut self, _detected_age: u32, _required_age: u32) {}

    fn on_state_changed(&mut self, session: &VerificationSession, _previous: VerificationState) {
        let (detected_age, granted) = match session.state() {
            VerificationState::Granted { detected_age } => (detected_age, true),
            VerificationState::Denied { detected_age } => (detected_age, false),
            _ => return,
        };
        let record = AccessRecord {
            item_id: self.item_id.clone(),
            detected_age,
            required_age: session.required_age(),
            granted,
            denial_reason: (!granted).then(|| "Age restriction".to_string()),
            origin: session.origin().unwrap_or(AgeOrigin::Estimated),
            time_bucket: TimeBucket::now_10min().ok(),
        };
        if let Err(err) = self.log.push(record) {
            log::warn!("AccessRecorder: {}", err);
        }
    }
}
