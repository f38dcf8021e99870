//! age_gate - face-based age verification gate

use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    age_gate::cli::run()
}
