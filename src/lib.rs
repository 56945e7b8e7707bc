//! Core of a stateful model checker for distributed-systems simulators: it explores the reachable
//! state space of actors communicating through message mailboxes, searching for safety assertion
//! failures, liveness acceptance cycles, and communication non-determinism.
//!
//! Parsing a [`config::Config`] out of argv or a file, and launching the application under test,
//! are the CLI binary's job (`src/main.rs`); this crate only consumes an already-built `Config`
//! and an already-attached [`protocol::Session`].

pub mod checker;
pub mod config;
pub mod dwarf;
pub mod error;
pub mod protocol;
pub mod remote;
pub mod request;
pub mod snapshot;

pub use checker::Checker;
pub use config::Config;
pub use error::{Error, ExitCode, Result};
pub use protocol::Session;
