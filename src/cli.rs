//! age_gate - face-based age verification from the command line
//!
//! `verify` runs one verification session against the configured capture
//! source and estimation service; `catalog` lists the content catalog.
//! Ctrl-C cancels a session in flight and releases the camera.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::access::{
    access_message, check_access, decide, AccessLog, AccessRecorder, AccessResponse, Decision,
};
use crate::capture::open_source;
use crate::catalog::{Catalog, ContentItem};
use crate::config::GateConfig;
use crate::estimate::open_estimator;
use crate::ui::Ui;
use crate::verify::{required_age_from_signed, VerificationMachine, VerificationState};

const DRIVE_TICK: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "age_gate", version, about = "Face-based age verification gate")]
struct Args {
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE", global = true)]
    ui: String,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify the viewer's age for a catalog item or an explicit minimum
    Verify {
        /// Catalog item id; its age rating becomes the required age
        #[arg(long, conflicts_with = "required_age")]
        item: Option<String>,
        /// Minimum age to grant access (defaults to the configured value)
        #[arg(long, allow_negative_numbers = true)]
        required_age: Option<i64>,
        /// TEST MODE ONLY: skip capture and estimation, decide on this age
        #[arg(long)]
        simulate_age: Option<u32>,
        /// Extra attempts after a failed one
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },

    /// List catalog items and their age ratings
    Catalog,
}

pub fn run() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let config = GateConfig::load()?;
    let catalog = load_catalog(&config)?;

    match args.command {
        Command::Verify {
            item,
            required_age,
            simulate_age,
            retries,
        } => {
            let request = VerifyRequest {
                item: item
                    .as_deref()
                    .map(|id| {
                        catalog
                            .get(id)
                            .cloned()
                            .ok_or_else(|| anyhow!("unknown catalog item '{}'", id))
                    })
                    .transpose()?,
                required_age: required_age.map(required_age_from_signed).transpose()?,
                simulate_age,
                retries,
                json: args.json,
            };
            cmd_verify(&config, &ui, request)
        }
        Command::Catalog => cmd_catalog(&catalog, args.json),
    }
}

fn load_catalog(config: &GateConfig) -> Result<Catalog> {
    match &config.catalog_path {
        Some(path) => Catalog::from_json_file(path),
        None => Ok(Catalog::demo()),
    }
}

struct VerifyRequest {
    item: Option<ContentItem>,
    required_age: Option<u32>,
    simulate_age: Option<u32>,
    retries: u32,
    json: bool,
}

fn cmd_verify(config: &GateConfig, ui: &Ui, request: VerifyRequest) -> Result<ExitCode> {
    if let Some(item) = &request.item {
        if !item.requires_verification() {
            println!("'{}' is unrestricted; no verification required.", item.title);
            return Ok(ExitCode::SUCCESS);
        }
    }
    let required_age = match (&request.item, request.required_age) {
        (Some(item), _) => item.age_rating,
        (None, Some(age)) => age,
        (None, None) => config.default_required_age,
    };
    if request.simulate_age.is_some() && !config.test_mode {
        return Err(anyhow!(
            "--simulate-age requires test mode (set AGE_GATE_TEST_MODE=1)"
        ));
    }

    let source = open_source(&config.capture)?;
    let estimator = open_estimator(&config.estimator, config.test_mode)?;
    let access_log = AccessLog::new();
    let item_id = request.item.as_ref().map(|item| item.id.clone());

    let mut machine = VerificationMachine::new(source, estimator, config.machine_options())
        .with_observer(ui.verification_progress())
        .with_observer(AccessRecorder::new(access_log.clone(), item_id));

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = cancelled.clone();
        ctrlc::set_handler(move || {
            cancelled.store(true, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    if let Some(title) = request.item.as_ref().map(|item| item.title.as_str()) {
        eprintln!("Verifying age for '{}' (minimum {})", title, required_age);
    }
    machine.open(required_age);

    let mut retries_left = request.retries;
    loop {
        drive(&mut machine, &cancelled);
        match machine.state() {
            VerificationState::Ready => match request.simulate_age {
                Some(age) => machine.simulate_age(age)?,
                None => machine.start_verification()?,
            },
            VerificationState::Failed { error } if retries_left > 0 => {
                retries_left -= 1;
                eprintln!("Attempt failed ({:?}); retrying", error);
                machine.retry()?;
            }
            VerificationState::Idle => {
                eprintln!("Verification cancelled.");
                return Ok(ExitCode::from(130));
            }
            _ => break,
        }
    }

    let state = machine.state();
    machine.close();

    match state {
        VerificationState::Granted { detected_age } | VerificationState::Denied { detected_age } => {
            let outcome = verify_outcome(request.item.as_ref(), required_age, detected_age);
            if request.json {
                print_json_report(outcome.access.as_ref(), &access_log)?;
            } else {
                println!("{}", outcome.message);
            }
            Ok(if outcome.granted {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        VerificationState::Failed { error } => Err(anyhow!(
            "verification failed ({:?}); try again with --retries",
            error
        )),
        other => Err(anyhow!("verification stopped in state {}", other)),
    }
}

struct VerifyOutcome {
    granted: bool,
    message: String,
    access: Option<AccessResponse>,
}

/// Catalog requests are answered by `check_access`; bare minimums by `decide`.
fn verify_outcome(
    item: Option<&ContentItem>,
    required_age: u32,
    detected_age: u32,
) -> VerifyOutcome {
    match item {
        Some(item) => {
            let response = check_access(item, detected_age);
            VerifyOutcome {
                granted: response.granted,
                message: response.message.clone(),
                access: Some(response),
            }
        }
        None => {
            let decision = decide(detected_age, required_age);
            VerifyOutcome {
                granted: decision == Decision::Granted,
                message: access_message(decision, required_age, detected_age),
                access: None,
            }
        }
    }
}

fn print_json_report(access: Option<&AccessResponse>, access_log: &AccessLog) -> Result<()> {
    let report = serde_json::json!({
        "access": access,
        "records": access_log.records(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Pump completions until the machine stops waiting or Ctrl-C is pressed.
fn drive(machine: &mut VerificationMachine, cancelled: &AtomicBool) {
    while machine.state().is_pending() {
        if cancelled.load(Ordering::SeqCst) {
            machine.close();
            return;
        }
        machine.wait(DRIVE_TICK);
    }
    if cancelled.load(Ordering::SeqCst) {
        machine.close();
    }
}

fn cmd_catalog(catalog: &Catalog, json: bool) -> Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(catalog.items())?);
        return Ok(ExitCode::SUCCESS);
    }
    println!("{:<6} {:<28} {:>4}  {:<12} {}", "ID", "TITLE", "MIN", "GENRE", "DURATION");
    for item in catalog.items() {
        let rating = if item.requires_verification() {
            format!("{}+", item.age_rating)
        } else {
            "all".to_string()
        };
        println!(
            "{:<6} {:<28} {:>4}  {:<12} {}",
            item.id,
            item.title,
            rating,
            item.genre.as_deref().unwrap_or("-"),
            item.duration.as_deref().unwrap_or("-")
        );
    }
    Ok(ExitCode::SUCCESS)
}
