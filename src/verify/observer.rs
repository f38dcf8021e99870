use super::state::{VerificationSession, VerificationState};

/// Host callbacks.
///
/// Exactly one of `on_granted` / `on_denied` fires for every attempt that
/// reaches a decision. Neither fires on failure or on `close()`.
/// Callbacks run on the thread driving the machine.
pub trait VerificationObserver: Send {
    fn on_granted(&mut self, detected_age: u32);

    fn on_denied(&mut self, detected_age: u32, required_age: u32);

    /// Called after every state change, including the decision itself.
    fn on_state_changed(&mut self, _session: &VerificationSession, _previous: VerificationState) {
    }
}

/// Adapts a pair of closures into an observer.
pub struct CallbackObserver<G, D>
where
    G: FnMut(u32) + Send,
    D: FnMut(u32, u32) + Send,
{
    granted: G,
    denied: D,
}

impl<G, D> CallbackObserver<G, D>
where
    G: FnMut(u32) + Send,
    D: FnMut(u32, u32) + Send,
{
    pub fn new(granted: G, denied: D) -> Self {
        Self { granted, denied }
    }
}

impl<G, D> VerificationObserver for CallbackObserver<G, D>
where
    G: FnMut(u32) + Send,
    D: FnMut(u32, u32) + Send,
{
    fn on_granted(&mut self, detected_age: u32) {
        (self.granted)(detected_age)
    }

    fn on_denied(&mut self, detected_age: u32, required_age: u32) {
        (self.denied)(detected_age, required_age)
    }
}
