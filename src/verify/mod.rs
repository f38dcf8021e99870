//! Age verification: session state, host callbacks and the state machine
//! that ties a capture source to an age estimator.

mod machine;
mod observer;
mod state;

pub use machine::{MachineOptions, VerificationMachine};
pub use observer::{CallbackObserver, VerificationObserver};
pub use state::{
    required_age_from_signed, AgeOrigin, ErrorKind, TransitionError, VerificationSession,
    VerificationState,
};
