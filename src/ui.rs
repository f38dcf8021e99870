//! Terminal progress for the `age_gate` CLI.
//!
//! Each pending verification state is shown as a stage: a spinner on a TTY,
//! plain `==>` lines otherwise. Output goes to stderr so stdout stays clean
//! for the decision itself.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::verify::{VerificationObserver, VerificationSession, VerificationState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Observer that opens a stage for every pending verification state.
    pub fn verification_progress(&self) -> StageObserver {
        StageObserver {
            ui: self.clone(),
            current: None,
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failure: Option<String>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            failure: None,
        }
    }

    /// Finish the stage marked as failed.
    pub fn fail(mut self, reason: &str) {
        self.failure = Some(reason.to_string());
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = format_duration(self.start.elapsed());
        let message = match &self.failure {
            Some(reason) => format!("✖ {} ({}): {}", self.name, elapsed, reason),
            None => format!("✔ {} ({})", self.name, elapsed),
        };
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// Renders state changes of a `VerificationMachine` as stages.
pub struct StageObserver {
    ui: Ui,
    current: Option<StageGuard>,
}

impl VerificationObserver for StageObserver {
    fn on_granted(&mut self, _detected_age: u32) {}

    fn on_denied(&mut self, _detected_age: u32, _required_age: u32) {}

    fn on_state_changed(&mut self, session: &VerificationSession, _previous: VerificationState) {
        let state = session.state();
        if let Some(stage) = self.current.take() {
            match state {
                VerificationState::Failed { error } => stage.fail(&format!("{error:?}")),
                VerificationState::Idle => stage.fail("cancelled"),
                _ => drop(stage),
            }
        }
        self.current = stage_name(state).map(|name| self.ui.stage(name));
    }
}

fn stage_name(state: VerificationState) -> Option<&'static str> {
    match state {
        VerificationState::AwaitingSource => Some("Acquire camera"),
        VerificationState::Capturing => Some("Capture frame"),
        VerificationState::Estimating => Some("Estimate age"),
        _ => None,
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_flag_selects_mode() {
        assert_eq!(Ui::from_args(Some("plain"), true, false).mode, UiMode::Plain);
        assert_eq!(Ui::from_args(Some("pretty"), true, false).mode, UiMode::Pretty);
        assert_eq!(Ui::from_args(None, true, false).mode, UiMode::Auto);
    }

    #[test]
    fn pretty_needs_a_tty() {
        assert!(!Ui::new(UiMode::Pretty, false, false).use_pretty());
        assert!(!Ui::new(UiMode::Auto, true, true).use_pretty());
        assert!(Ui::new(UiMode::Auto, true, false).use_pretty());
        assert!(!Ui::new(UiMode::Plain, true, false).use_pretty());
    }

    #[test]
    fn only_pending_states_are_stages() {
        assert!(stage_name(VerificationState::Estimating).is_some());
        assert!(stage_name(VerificationState::Ready).is_none());
        assert!(stage_name(VerificationState::Granted { detected_age: 30 }).is_none());
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
