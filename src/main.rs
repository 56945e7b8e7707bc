//! Command-line front-end: parses the checker's CLI surface into a [`statecheck::Config`],
//! launches the application under test, and runs whichever checker the configuration selects.
//!
//! Building `Config` out of argv is explicitly this binary's job, not the library's (spec §1
//! Non-goals "no argv/TOML parser in the core") — the core only ever consumes an already-built
//! `Config`, the same way it only ever consumes an already-compiled `Automaton`.

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use clap::Parser;

use statecheck::checker::automaton::Automaton;
use statecheck::config::{Config, Reduction};
use statecheck::{Checker, Session};

/// Explore the state space of an application built against the statecheck wire protocol.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Application under test.
    program: String,

    /// Backtrack once the exploration stack reaches this depth.
    #[arg(long, default_value_t = Config::default().max_depth)]
    max_depth: u32,

    /// Bound on the visited-state set size, 0 = unbounded.
    #[arg(long, default_value_t = Config::default().visited_max)]
    visited_max: i32,

    /// Keep a full snapshot every N states, 0 = always snapshot.
    #[arg(long, default_value_t = Config::default().checkpoint_period)]
    checkpoint_period: u32,

    /// Safety-exploration reduction strategy ("none" or "dpor").
    #[arg(long, value_enum, default_value = "dpor")]
    reduction: CliReduction,

    /// Enable non-progressive-cycle (non-termination) detection.
    #[arg(long)]
    termination: bool,

    /// Enable the communication-determinism checker (receive order included).
    #[arg(long)]
    comms_determinism: bool,

    /// Enable the send-determinism checker (send order only).
    #[arg(long)]
    send_determinism: bool,

    /// Selects liveness mode: path to a pre-compiled LTL automaton (TOML).
    #[arg(long)]
    property_file: Option<PathBuf>,

    /// Compute and compare snapshot content hashes.
    #[arg(long)]
    hash: bool,

    /// Use PageStore/Chunked regions instead of Flat regions.
    #[arg(long)]
    sparse_checkpoint: bool,

    /// Emit the explored state graph here.
    #[arg(long)]
    dot_output: Option<PathBuf>,

    /// Arguments passed through to the application.
    #[arg(raw(true))]
    args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliReduction {
    None,
    Dpor,
}

impl From<CliReduction> for Reduction {
    fn from(value: CliReduction) -> Self {
        match value {
            CliReduction::None => Reduction::None,
            CliReduction::Dpor => Reduction::Dpor,
        }
    }
}

fn main() -> ProcessExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = Config {
        max_depth: args.max_depth,
        visited_max: args.visited_max,
        checkpoint_period: args.checkpoint_period,
        reduction: args.reduction.into(),
        termination: args.termination,
        comms_determinism: args.comms_determinism,
        send_determinism: args.send_determinism,
        property_file: args.property_file,
        hash: args.hash,
        sparse_checkpoint: args.sparse_checkpoint,
        dot_output: args.dot_output,
    };

    let automaton = match load_automaton(&config) {
        Ok(a) => a,
        Err(e) => {
            log::error!("failed to load property automaton: {e:#}");
            return ProcessExitCode::from(statecheck::ExitCode::InternalError as u8);
        }
    };

    let session = match Session::launch(&args.program, args.args) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to launch application: {e}");
            return ProcessExitCode::from(e.exit_code() as u8);
        }
    };

    // Make sure a Ctrl-C during exploration doesn't orphan the application under test (mirrors
    // the teacher's `tui` handler, which exists for the same "don't leave the debuggee running"
    // reason).
    let pid = session.pid();
    let _ = ctrlc::set_handler(move || {
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
        std::process::exit(statecheck::ExitCode::InternalError as i32);
    });

    let mut checker = Checker::new(session, config, automaton);
    match checker.run() {
        Ok(code) => {
            log::info!("{code}");
            ProcessExitCode::from(code as u8)
        }
        Err(e) => {
            log::error!("{e}");
            ProcessExitCode::from(e.exit_code() as u8)
        }
    }
}

fn load_automaton(config: &Config) -> anyhow::Result<Option<Automaton>> {
    let Some(path) = &config.property_file else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)?;
    let automaton = Automaton::from_toml_str(&text)?;
    Ok(Some(automaton))
}
