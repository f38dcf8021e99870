//! The verification state machine.
//!
//! One machine drives one session at a time on the caller's thread. Device
//! and service calls run on short-lived worker threads and report back over a
//! single completion channel; the host pumps that channel with `poll`,
//! `wait` or `settle`.
//!
//! Every completion is stamped with the generation current at dispatch.
//! `open`, `close`, `retry`, failures and timeouts advance the generation, so
//! a completion that outlives its attempt is discarded instead of applied.
//! A capture handle arriving late is released on the spot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::access::{decide, Decision};
use crate::capture::{CaptureConstraints, CaptureError, CaptureHandle, CaptureSource, Readiness};
use crate::estimate::{AgeEstimator, EstimateError, EstimationResult};
use crate::frame::CapturedFrame;

use super::observer::VerificationObserver;
use super::state::{
    AgeOrigin, ErrorKind, TransitionError, VerificationSession, VerificationState,
};

/// Pause between frame grabs while the device has no decodable frame.
const FRAME_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Tunables for a machine.
#[derive(Clone, Debug)]
pub struct MachineOptions {
    pub constraints: CaptureConstraints,
    /// Deadline for one estimation call.
    pub estimate_timeout: Duration,
    /// How long frame capture waits for a first decodable frame.
    pub frame_wait: Duration,
    /// Allowance on top of `frame_wait` for a single device read before the
    /// capture is abandoned with `NotReady`.
    pub capture_grace: Duration,
    /// Enables `simulate_age`. Must be off in production.
    pub test_mode: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            constraints: CaptureConstraints::default(),
            estimate_timeout: Duration::from_secs(10),
            frame_wait: Duration::from_secs(2),
            capture_grace: Duration::from_secs(5),
            test_mode: false,
        }
    }
}

/// A capture handle shared between the machine and a capture worker.
///
/// The machine never waits on the handle lock. `release` marks the handle and
/// releases it on the spot only when the lock is free; a worker holding the
/// lock checks the mark after every frame grab and releases on its way out.
struct SharedHandle {
    handle: Mutex<Box<dyn CaptureHandle>>,
    release_pending: AtomicBool,
    released: AtomicBool,
}

impl SharedHandle {
    fn new(handle: Box<dyn CaptureHandle>) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(handle),
            release_pending: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    /// `None` while a worker is reading from the device.
    fn readiness(&self) -> Option<Readiness> {
        match self.handle.try_lock() {
            Ok(guard) => Some(guard.readiness()),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => Some(Readiness::Errored),
        }
    }

    fn release(&self) {
        self.release_pending.store(true, Ordering::SeqCst);
        match self.handle.try_lock() {
            Ok(mut guard) => self.release_once(guard.as_mut()),
            Err(TryLockError::Poisoned(poisoned)) => {
                self.release_once(poisoned.into_inner().as_mut())
            }
            Err(TryLockError::WouldBlock) => {
                log::debug!("capture in progress; release deferred to the capture worker")
            }
        }
    }

    fn release_once(&self, handle: &mut dyn CaptureHandle) {
        if !self.released.swap(true, Ordering::SeqCst) {
            handle.release();
        }
    }

    fn release_requested(&self) -> bool {
        self.release_pending.load(Ordering::SeqCst)
    }

    /// One frame grab. A release requested while it ran is completed here.
    fn capture(&self) -> Result<CapturedFrame, CaptureError> {
        if self.release_requested() {
            return Err(CaptureError::DeviceUnavailable(
                "capture handle released".to_string(),
            ));
        }
        let attempt = match self.handle.lock() {
            Ok(mut guard) => guard.capture_frame(),
            Err(_) => Err(CaptureError::DeviceUnavailable(
                "capture handle lock poisoned".to_string(),
            )),
        };
        if self.release_requested() {
            match self.handle.lock() {
                Ok(mut guard) => self.release_once(guard.as_mut()),
                Err(poisoned) => self.release_once(poisoned.into_inner().as_mut()),
            }
        }
        attempt
    }
}

/// Bound on how long the machine stays in one pending state.
#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    budget: Duration,
    state: VerificationState,
    error: ErrorKind,
}

enum Completion {
    SourceAcquired(Result<Box<dyn CaptureHandle>, CaptureError>),
    FrameCaptured(Result<CapturedFrame, CaptureError>),
    EstimateSettled(Result<EstimationResult, EstimateError>),
}

impl Completion {
    fn label(&self) -> &'static str {
        match self {
            Completion::SourceAcquired(_) => "source-acquired",
            Completion::FrameCaptured(_) => "frame-captured",
            Completion::EstimateSettled(_) => "estimate-settled",
        }
    }
}

struct Notification {
    generation: u64,
    completion: Completion,
}

/// Age verification state machine.
pub struct VerificationMachine {
    source: Arc<dyn CaptureSource>,
    estimator: Arc<dyn AgeEstimator>,
    options: MachineOptions,
    session: VerificationSession,
    next_session_id: u64,
    handle: Option<Arc<SharedHandle>>,
    generation: Arc<AtomicU64>,
    /// Serializes acquire workers so a cancelled acquisition has released
    /// the device before the next one claims it.
    acquire_lock: Arc<Mutex<()>>,
    deadline: Option<Deadline>,
    observers: Vec<Box<dyn VerificationObserver>>,
    tx: Sender<Notification>,
    rx: Receiver<Notification>,
}

impl VerificationMachine {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        estimator: Arc<dyn AgeEstimator>,
        options: MachineOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            source,
            estimator,
            options,
            session: VerificationSession::idle(),
            next_session_id: 0,
            handle: None,
            generation: Arc::new(AtomicU64::new(0)),
            acquire_lock: Arc::new(Mutex::new(())),
            deadline: None,
            observers: Vec::new(),
            tx,
            rx,
        }
    }

    pub fn with_observer(mut self, observer: impl VerificationObserver + 'static) -> Self {
        self.add_observer(Box::new(observer));
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn VerificationObserver>) {
        self.observers.push(observer);
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    pub fn session(&self) -> &VerificationSession {
        &self.session
    }

    pub fn state(&self) -> VerificationState {
        self.session.state
    }

    /// Readiness of the capture device as owned by the current session.
    pub fn capture_readiness(&self) -> Readiness {
        match &self.handle {
            // Busy means a frame grab is running on a live device.
            Some(handle) => handle.readiness().unwrap_or(Readiness::Ready),
            None => match self.session.state {
                VerificationState::AwaitingSource => Readiness::Initializing,
                VerificationState::Failed { error } if error.is_capture() => Readiness::Errored,
                _ => Readiness::Unavailable,
            },
        }
    }

    // ------------------------------------------------------------------
    // Host operations
    // ------------------------------------------------------------------

    /// Start a new session. Any previous session is closed first.
    pub fn open(&mut self, required_age: u32) {
        self.close();
        self.next_session_id += 1;
        self.session = VerificationSession::opened(self.next_session_id, required_age);
        log::info!(
            "verification session {} opened (required age {})",
            self.session.id,
            required_age
        );
        self.begin_acquisition();
    }

    /// Capture a frame and submit it for estimation. Valid only in `Ready`.
    pub fn start_verification(&mut self) -> Result<(), TransitionError> {
        if self.session.state != VerificationState::Ready {
            return Err(self.reject("start_verification"));
        }
        let Some(handle) = self.handle.clone() else {
            self.transition(VerificationState::Capturing);
            self.fail(ErrorKind::DeviceUnavailable, "no capture handle held");
            return Ok(());
        };

        self.transition(VerificationState::Capturing);
        self.arm_deadline(
            self.options.frame_wait + self.options.capture_grace,
            ErrorKind::NotReady,
        );
        let generation = self.generation.clone();
        let dispatched = self.current_generation();
        let frame_wait = self.options.frame_wait;
        self.dispatch("capture", move || {
            Completion::FrameCaptured(capture_with_wait(
                &handle,
                &generation,
                dispatched,
                frame_wait,
            ))
        });
        Ok(())
    }

    /// Test-mode affordance: decide on `age` without touching device or service.
    pub fn simulate_age(&mut self, age: u32) -> Result<(), TransitionError> {
        if !self.options.test_mode {
            log::warn!("simulate_age({}) refused: test mode disabled", age);
            return Err(TransitionError::TestModeDisabled);
        }
        if self.session.state != VerificationState::Ready {
            return Err(self.reject("simulate_age"));
        }
        log::warn!(
            "session {}: TEST MODE simulated age {} injected",
            self.session.id,
            age
        );
        self.transition(VerificationState::Estimating);
        self.conclude(age, AgeOrigin::Simulated);
        Ok(())
    }

    /// Start another attempt after a decision or failure.
    ///
    /// Reuses the capture handle when it is still held and ready, otherwise
    /// re-acquires the source.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        if !self.session.state.is_terminal() {
            return Err(self.reject("retry"));
        }
        self.invalidate();
        self.deadline = None;
        self.session.attempt += 1;
        self.session.origin = None;

        let reusable = self
            .handle
            .as_ref()
            .and_then(|handle| handle.readiness())
            == Some(Readiness::Ready);
        log::info!(
            "session {}: retry (attempt {}, reuse source: {})",
            self.session.id,
            self.session.attempt,
            reusable
        );
        if reusable {
            self.transition(VerificationState::Ready);
        } else {
            self.release_handle();
            self.begin_acquisition();
        }
        Ok(())
    }

    /// Cancel the session from any state, release the device and return to `Idle`.
    /// Idempotent; never fires a decision callback.
    pub fn close(&mut self) {
        self.invalidate();
        self.deadline = None;
        self.release_handle();
        // Drop whatever is queued; a queued handle releases itself on drop.
        while let Ok(stale) = self.rx.try_recv() {
            self.discard(stale);
        }
        if self.session.state != VerificationState::Idle {
            log::info!("verification session {} closed", self.session.id);
            self.transition(VerificationState::Idle);
        }
        self.session.origin = None;
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    /// Apply every completion already delivered and enforce the capture and
    /// estimation deadlines. Never blocks. Returns the number of transitions applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(notification) = self.rx.try_recv() {
            if self.apply(notification) {
                applied += 1;
            }
        }
        if self.enforce_deadline() {
            applied += 1;
        }
        applied
    }

    /// Block until at least one transition is applied or `max` elapses.
    pub fn wait(&mut self, max: Duration) -> bool {
        let until = Instant::now() + max;
        loop {
            if self.poll() > 0 {
                return true;
            }
            let now = Instant::now();
            if now >= until {
                return false;
            }
            let limit = match self.deadline {
                Some(deadline) => deadline.at.min(until),
                None => until,
            };
            match self.rx.recv_timeout(limit.saturating_duration_since(now)) {
                Ok(notification) => {
                    if self.apply(notification) {
                        return true;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Drive the machine until it leaves the pending states or `max` elapses.
    pub fn settle(&mut self, max: Duration) -> VerificationState {
        let until = Instant::now() + max;
        while self.session.state.is_pending() {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.wait(remaining);
        }
        self.session.state
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn reject(&self, operation: &'static str) -> TransitionError {
        let err = TransitionError::InvalidTransition {
            operation,
            state: self.session.state,
        };
        log::warn!("session {}: {}", self.session.id, err);
        err
    }

    /// The single mutation point for session state.
    fn transition(&mut self, next: VerificationState) {
        let previous = self.session.state;
        if !previous.allows(&next) {
            log::error!(
                "session {}: illegal transition {} -> {} ignored",
                self.session.id,
                previous,
                next
            );
            debug_assert!(false, "illegal transition {previous} -> {next}");
            return;
        }
        self.session.state = next;
        log::debug!(
            "session {}: {} -> {}",
            self.session.id,
            previous,
            next
        );

        for observer in self.observers.iter_mut() {
            match next {
                VerificationState::Granted { detected_age } => observer.on_granted(detected_age),
                VerificationState::Denied { detected_age } => {
                    observer.on_denied(detected_age, self.session.required_age)
                }
                _ => {}
            }
            observer.on_state_changed(&self.session, previous);
        }
    }

    fn dispatch<F>(&mut self, label: &'static str, job: F)
    where
        F: FnOnce() -> Completion + Send + 'static,
    {
        let tx = self.tx.clone();
        let generation = self.current_generation();
        let spawned = thread::Builder::new()
            .name(format!("age-gate-{label}"))
            .spawn(move || {
                let completion = job();
                // The machine may already be gone; nothing left to notify.
                let _ = tx.send(Notification {
                    generation,
                    completion,
                });
            });
        if let Err(err) = spawned {
            let kind = if label == "estimate" {
                ErrorKind::ServiceError
            } else {
                ErrorKind::DeviceUnavailable
            };
            self.fail(kind, &format!("spawn {label} worker: {err}"));
        }
    }

    fn begin_acquisition(&mut self) {
        self.transition(VerificationState::AwaitingSource);
        let source = self.source.clone();
        let constraints = self.options.constraints.clone();
        let generation = self.generation.clone();
        let dispatched = self.current_generation();
        let acquire_lock = self.acquire_lock.clone();
        log::info!(
            "session {}: acquiring capture source {}",
            self.session.id,
            source.name()
        );
        self.dispatch("acquire", move || {
            let _serial = acquire_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if generation.load(Ordering::SeqCst) != dispatched {
                return Completion::SourceAcquired(Err(CaptureError::DeviceUnavailable(
                    "acquisition cancelled".to_string(),
                )));
            }
            let acquired = source.acquire(&constraints);
            match acquired {
                // Cancelled while acquiring: give the device back immediately.
                Ok(mut handle) if generation.load(Ordering::SeqCst) != dispatched => {
                    handle.release();
                    Completion::SourceAcquired(Ok(handle))
                }
                other => Completion::SourceAcquired(other),
            }
        });
    }

    fn begin_estimate(&mut self, frame: CapturedFrame) {
        log::info!(
            "session {}: frame {} captured ({}x{}, {} bytes), estimating via {}",
            self.session.id,
            frame.fingerprint(),
            frame.width,
            frame.height,
            frame.byte_len(),
            self.estimator.name()
        );
        self.transition(VerificationState::Estimating);
        self.arm_deadline(self.options.estimate_timeout, ErrorKind::Timeout);
        let estimator = self.estimator.clone();
        self.dispatch("estimate", move || {
            Completion::EstimateSettled(estimator.estimate(&frame))
        });
    }

    fn conclude(&mut self, detected_age: u32, origin: AgeOrigin) {
        self.deadline = None;
        self.session.origin = Some(origin);
        let required_age = self.session.required_age;
        let next = match decide(detected_age, required_age) {
            Decision::Granted => VerificationState::Granted { detected_age },
            Decision::Denied => VerificationState::Denied { detected_age },
        };
        log::info!(
            "session {}: {} (detected {}, required {}, {:?})",
            self.session.id,
            next.name(),
            detected_age,
            required_age,
            origin
        );
        self.transition(next);
    }

    /// Enter `Failed`, releasing the device first.
    fn fail(&mut self, error: ErrorKind, detail: &str) {
        self.invalidate();
        self.deadline = None;
        self.release_handle();
        log::warn!(
            "session {}: verification failed ({:?}): {}",
            self.session.id,
            error,
            detail
        );
        self.transition(VerificationState::Failed { error });
    }

    /// Bound the current pending state; `enforce_deadline` fails it with `error`.
    fn arm_deadline(&mut self, budget: Duration, error: ErrorKind) {
        self.deadline = Some(Deadline {
            at: Instant::now() + budget,
            budget,
            state: self.session.state,
            error,
        });
    }

    fn enforce_deadline(&mut self) -> bool {
        match self.deadline {
            Some(deadline)
                if self.session.state == deadline.state && Instant::now() >= deadline.at =>
            {
                self.fail(
                    deadline.error,
                    &format!(
                        "still {} after {}ms",
                        deadline.state,
                        deadline.budget.as_millis()
                    ),
                );
                true
            }
            _ => false,
        }
    }

    fn release_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }

    fn discard(&self, notification: Notification) {
        log::debug!(
            "session {}: discarding stale {} (generation {}, current {})",
            self.session.id,
            notification.completion.label(),
            notification.generation,
            self.current_generation()
        );
        if let Completion::SourceAcquired(Ok(mut handle)) = notification.completion {
            handle.release();
        }
    }

    fn apply(&mut self, notification: Notification) -> bool {
        if notification.generation != self.current_generation() {
            self.discard(notification);
            return false;
        }

        match (self.session.state, notification.completion) {
            (VerificationState::AwaitingSource, Completion::SourceAcquired(Ok(handle))) => {
                log::info!("session {}: capture source ready", self.session.id);
                self.handle = Some(SharedHandle::new(handle));
                self.transition(VerificationState::Ready);
            }
            (VerificationState::AwaitingSource, Completion::SourceAcquired(Err(err))) => {
                self.fail(ErrorKind::from(&err), &err.to_string());
            }
            (VerificationState::Capturing, Completion::FrameCaptured(Ok(frame))) => {
                self.begin_estimate(frame);
            }
            (VerificationState::Capturing, Completion::FrameCaptured(Err(err))) => {
                self.fail(ErrorKind::from(&err), &err.to_string());
            }
            (VerificationState::Estimating, Completion::EstimateSettled(Ok(result))) => {
                self.conclude(result.estimated_age, AgeOrigin::Estimated);
            }
            (VerificationState::Estimating, Completion::EstimateSettled(Err(err))) => {
                self.fail(ErrorKind::from(&err), &err.to_string());
            }
            (state, completion) => {
                log::warn!(
                    "session {}: unexpected {} in state {}",
                    self.session.id,
                    completion.label(),
                    state
                );
                if let Completion::SourceAcquired(Ok(mut handle)) = completion {
                    handle.release();
                }
                return false;
            }
        }
        true
    }
}

impl Drop for VerificationMachine {
    fn drop(&mut self) {
        self.invalidate();
        self.release_handle();
    }
}

/// Grab one frame, retrying while the device has nothing decodable yet.
fn capture_with_wait(
    handle: &SharedHandle,
    generation: &AtomicU64,
    dispatched: u64,
    frame_wait: Duration,
) -> Result<CapturedFrame, CaptureError> {
    let deadline = Instant::now() + frame_wait;
    loop {
        match handle.capture() {
            Err(CaptureError::NotReady)
                if Instant::now() < deadline
                    && generation.load(Ordering::SeqCst) == dispatched =>
            {
                thread::sleep(FRAME_RETRY_INTERVAL);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{StubCaptureConfig, StubCaptureSource};
    use crate::estimate::StubAgeEstimator;
    use std::sync::atomic::AtomicUsize;

    const SETTLE: Duration = Duration::from_secs(5);

    #[derive(Clone, Default)]
    struct Counts {
        granted: Arc<AtomicUsize>,
        denied: Arc<AtomicUsize>,
        changes: Arc<AtomicUsize>,
    }

    impl VerificationObserver for Counts {
        fn on_granted(&mut self, _detected_age: u32) {
            self.granted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_denied(&mut self, _detected_age: u32, _required_age: u32) {
            self.denied.fetch_add(1, Ordering::SeqCst);
        }

        fn on_state_changed(&mut self, _session: &VerificationSession, _previous: VerificationState) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn machine(
        source: Arc<StubCaptureSource>,
        estimator: StubAgeEstimator,
        options: MachineOptions,
    ) -> (VerificationMachine, Counts) {
        let counts = Counts::default();
        let machine = VerificationMachine::new(source, Arc::new(estimator), options)
            .with_observer(counts.clone());
        (machine, counts)
    }

    #[test]
    fn open_reaches_ready_and_holds_device() {
        let source = Arc::new(StubCaptureSource::default());
        let (mut m, _) = machine(source.clone(), StubAgeEstimator::fixed(30), MachineOptions::default());
        assert_eq!(m.capture_readiness(), Readiness::Unavailable);

        m.open(18);
        assert_eq!(m.state(), VerificationState::AwaitingSource);
        assert_eq!(m.settle(SETTLE), VerificationState::Ready);
        assert!(source.is_in_use());
        assert_eq!(m.capture_readiness(), Readiness::Ready);
        assert_eq!(m.session().attempt(), 1);
        assert_eq!(m.session().required_age(), 18);
    }

    #[test]
    fn frame_capture_waits_for_warm_up() {
        let source = Arc::new(StubCaptureSource::new(StubCaptureConfig {
            warm_up: Duration::from_millis(150),
            ..StubCaptureConfig::default()
        }));
        let (mut m, counts) =
            machine(source.clone(), StubAgeEstimator::fixed(40), MachineOptions::default());
        m.open(18);
        m.settle(SETTLE);
        m.start_verification().unwrap();
        assert_eq!(
            m.settle(SETTLE),
            VerificationState::Granted { detected_age: 40 }
        );
        assert_eq!(counts.granted.load(Ordering::SeqCst), 1);
        assert_eq!(source.frames_captured(), 1);
    }

    #[test]
    fn frame_wait_expiry_fails_with_not_ready() {
        let source = Arc::new(StubCaptureSource::new(StubCaptureConfig {
            warm_up: Duration::from_secs(30),
            ..StubCaptureConfig::default()
        }));
        let options = MachineOptions {
            frame_wait: Duration::from_millis(100),
            ..MachineOptions::default()
        };
        let (mut m, counts) = machine(source.clone(), StubAgeEstimator::fixed(40), options);
        m.open(18);
        m.settle(SETTLE);
        m.start_verification().unwrap();
        assert_eq!(
            m.settle(SETTLE),
            VerificationState::Failed {
                error: ErrorKind::NotReady
            }
        );
        assert!(!source.is_in_use());
        assert_eq!(counts.granted.load(Ordering::SeqCst), 0);
        assert_eq!(counts.denied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn estimate_deadline_is_enforced_by_poll() {
        let source = Arc::new(StubCaptureSource::default());
        let options = MachineOptions {
            estimate_timeout: Duration::from_millis(50),
            ..MachineOptions::default()
        };
        let estimator = StubAgeEstimator::fixed(30).with_delay(Duration::from_millis(500));
        let (mut m, _) = machine(source.clone(), estimator, options);
        m.open(18);
        m.settle(SETTLE);
        m.start_verification().unwrap();

        let deadline = Instant::now() + SETTLE;
        while m.state().is_pending() && Instant::now() < deadline {
            m.poll();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            m.state(),
            VerificationState::Failed {
                error: ErrorKind::Timeout
            }
        );
        assert!(!source.is_in_use());

        // The late estimate lands on a stale generation.
        thread::sleep(Duration::from_millis(600));
        assert_eq!(m.poll(), 0);
        assert!(m.state().is_terminal());
    }

    #[test]
    fn stale_acquisition_is_released() {
        let source = Arc::new(StubCaptureSource::new(StubCaptureConfig {
            acquire_delay: Duration::from_millis(100),
            ..StubCaptureConfig::default()
        }));
        let (mut m, _) = machine(source.clone(), StubAgeEstimator::fixed(30), MachineOptions::default());
        m.open(18);
        m.close();
        assert_eq!(m.state(), VerificationState::Idle);

        thread::sleep(Duration::from_millis(250));
        assert_eq!(m.poll(), 0);
        assert_eq!(m.state(), VerificationState::Idle);
        assert!(!source.is_in_use());
        assert_eq!(source.acquire_count(), source.release_count());
    }

    #[test]
    fn rejected_operations_leave_state_unchanged() {
        let source = Arc::new(StubCaptureSource::default());
        let (mut m, counts) = machine(source, StubAgeEstimator::fixed(30), MachineOptions::default());

        let err = m.start_verification().unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidTransition {
                operation: "start_verification",
                state: VerificationState::Idle
            }
        ));
        assert!(m.retry().is_err());
        assert_eq!(m.state(), VerificationState::Idle);
        assert_eq!(counts.changes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn simulate_age_requires_test_mode() {
        let source = Arc::new(StubCaptureSource::default());
        let (mut m, counts) =
            machine(source.clone(), StubAgeEstimator::fixed(30), MachineOptions::default());
        m.open(18);
        m.settle(SETTLE);
        assert_eq!(m.simulate_age(25), Err(TransitionError::TestModeDisabled));
        assert_eq!(m.state(), VerificationState::Ready);

        let options = MachineOptions {
            test_mode: true,
            ..MachineOptions::default()
        };
        let estimator = StubAgeEstimator::fixed(30);
        let (mut m, counts_test) = machine(Arc::new(StubCaptureSource::default()), estimator, options);
        assert!(m.simulate_age(25).is_err());
        m.open(21);
        m.settle(SETTLE);
        m.simulate_age(20).unwrap();
        assert_eq!(m.state(), VerificationState::Denied { detected_age: 20 });
        assert_eq!(m.session().origin(), Some(AgeOrigin::Simulated));
        assert_eq!(counts_test.denied.load(Ordering::SeqCst), 1);
        assert_eq!(counts.denied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retry_after_failure_reacquires() {
        let source = Arc::new(StubCaptureSource::default());
        let (mut m, _) = machine(
            source.clone(),
            StubAgeEstimator::scripted(vec![Err(EstimateError::Status(503)), Ok(19)]),
            MachineOptions::default(),
        );
        m.open(18);
        m.settle(SETTLE);
        m.start_verification().unwrap();
        assert_eq!(
            m.settle(SETTLE),
            VerificationState::Failed {
                error: ErrorKind::ServiceError
            }
        );
        assert_eq!(source.release_count(), 1);

        m.retry().unwrap();
        assert_eq!(m.state(), VerificationState::AwaitingSource);
        assert_eq!(m.settle(SETTLE), VerificationState::Ready);
        assert_eq!(m.session().attempt(), 2);
        m.start_verification().unwrap();
        assert_eq!(
            m.settle(SETTLE),
            VerificationState::Granted { detected_age: 19 }
        );
        assert_eq!(source.acquire_count(), 2);
    }

    #[test]
    fn drop_releases_device() {
        let source = Arc::new(StubCaptureSource::default());
        {
            let (mut m, _) =
                machine(source.clone(), StubAgeEstimator::fixed(30), MachineOptions::default());
            m.open(18);
            m.settle(SETTLE);
            assert!(source.is_in_use());
        }
        assert!(!source.is_in_use());
    }

    /// Device whose frame grab blocks for `delay`.
    struct SlowSource {
        delay: Duration,
        released: Arc<AtomicUsize>,
    }

    struct SlowHandle {
        delay: Duration,
        released: Arc<AtomicUsize>,
    }

    impl CaptureSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        fn acquire(
            &self,
            _constraints: &CaptureConstraints,
        ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
            Ok(Box::new(SlowHandle {
                delay: self.delay,
                released: self.released.clone(),
            }))
        }
    }

    impl CaptureHandle for SlowHandle {
        fn readiness(&self) -> Readiness {
            Readiness::Ready
        }

        fn capture_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
            thread::sleep(self.delay);
            CapturedFrame::encode_rgb(&[90u8; 4 * 4 * 3], 4, 4)
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn slow_machine(
        delay: Duration,
        options: MachineOptions,
    ) -> (VerificationMachine, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let source = SlowSource {
            delay,
            released: released.clone(),
        };
        let machine =
            VerificationMachine::new(Arc::new(source), Arc::new(StubAgeEstimator::fixed(30)), options);
        (machine, released)
    }

    #[test]
    fn close_does_not_wait_for_a_blocked_frame_grab() {
        let (mut m, released) = slow_machine(Duration::from_secs(2), MachineOptions::default());
        m.open(18);
        assert_eq!(m.settle(SETTLE), VerificationState::Ready);
        m.start_verification().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(m.capture_readiness(), Readiness::Ready);

        let started = Instant::now();
        m.close();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "close took {:?}",
            started.elapsed()
        );
        assert_eq!(m.state(), VerificationState::Idle);

        // The worker completes the release once the device returns.
        let deadline = Instant::now() + SETTLE;
        while released.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(m.poll(), 0);
        assert_eq!(m.state(), VerificationState::Idle);
    }

    #[test]
    fn stalled_capture_fails_with_not_ready() {
        let options = MachineOptions {
            frame_wait: Duration::from_millis(50),
            capture_grace: Duration::from_millis(150),
            ..MachineOptions::default()
        };
        let (mut m, released) = slow_machine(Duration::from_secs(2), options);
        m.open(18);
        m.settle(SETTLE);
        m.start_verification().unwrap();

        let started = Instant::now();
        assert_eq!(
            m.settle(SETTLE),
            VerificationState::Failed {
                error: ErrorKind::NotReady
            }
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(m.capture_readiness(), Readiness::Errored);

        thread::sleep(Duration::from_millis(2_200));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(m.poll(), 0);
        assert!(m.state().is_terminal());
    }
}
