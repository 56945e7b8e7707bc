//! Exploration context and the safety/liveness/communication-determinism checkers built on top
//! of it (spec §4.9–§4.11, supplemented by SPEC_FULL.md §4.9–4.11).

pub mod automaton;
pub mod commdet;
pub mod liveness;
pub mod replay;
pub mod safety;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::checker::automaton::Automaton;
use crate::config::{Config, Reduction};
use crate::error::{Error, ExitCode, Result};
use crate::protocol::Session;
use crate::request::{ActorId, ActorState, ActorStatus, Transition};
use crate::snapshot::{PageStore, Snapshot};

/// One frame of the exploration stack: the state that was reached, what each actor is allowed to
/// try next from here, and (for DPOR backtrack) the transition chosen to advance past it.
pub struct ExplorationState {
    pub seq: u64,
    /// `Some` only on checkpoint depths (spec §4.11); intervening depths replay from the nearest
    /// checkpointed ancestor instead of carrying their own `Snapshot`.
    pub checkpoint: Option<Rc<Snapshot>>,
    pub actor_states: BTreeMap<ActorId, ActorState>,
    pub executed_req: Option<Transition>,
}

impl ExplorationState {
    pub fn interleave_size(&self) -> usize {
        self.actor_states.values().filter(|a| a.status == ActorStatus::Todo).count()
    }

    pub fn pick_todo_actor(&self) -> Option<ActorId> {
        self.actor_states
            .iter()
            .find(|(_, s)| s.status == ActorStatus::Todo)
            .map(|(&id, _)| id)
    }
}

/// What [`replay::replay_to`] needs from one exploration-stack frame, implemented both by
/// [`ExplorationState`] directly (safety/comm-det) and by liveness's `PairState` wrapper.
pub trait StackFrame {
    fn checkpoint(&self) -> Option<&Rc<Snapshot>>;
    fn executed_req(&self) -> Option<&Transition>;
}

impl StackFrame for ExplorationState {
    fn checkpoint(&self) -> Option<&Rc<Snapshot>> {
        self.checkpoint.as_ref()
    }
    fn executed_req(&self) -> Option<&Transition> {
        self.executed_req.as_ref()
    }
}

/// One entry of the record-trace printed on a property violation (spec §6 "pid,value;pid,value;…").
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RecordTraceElement {
    pub actor: ActorId,
    pub times_considered: i32,
}

impl std::fmt::Display for RecordTraceElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.actor, self.times_considered)
    }
}

pub fn format_trace(trace: &[RecordTraceElement]) -> String {
    trace.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(";")
}

/// Seeds a freshly-reached state's per-actor bookkeeping: under DPOR, exactly one enabled actor
/// starts `Todo` (the rest `Disabled`); under `None` reduction, every enabled actor starts `Todo`
/// (spec §4.9 "Initial"/"Forward step").
pub fn seed_actor_states(enabled: &std::collections::BTreeSet<ActorId>, reduction: Reduction) -> BTreeMap<ActorId, ActorState> {
    let mut states = BTreeMap::new();
    for (i, &actor) in enabled.iter().enumerate() {
        let todo = match reduction {
            Reduction::Dpor => i == 0,
            Reduction::None => true,
        };
        states.insert(
            actor,
            ActorState {
                status: if todo { ActorStatus::Todo } else { ActorStatus::Disabled },
                times_considered: 0,
            },
        );
    }
    states
}

/// Owns the application session, the shared page store, and configuration; the thing each
/// checker's DFS drives forward (design notes §9 "materialize a single Checker context object").
pub struct Checker {
    pub config: Config,
    pub session: Session,
    pub store: Rc<RefCell<PageStore>>,
    /// `Some` only in liveness mode, where `config.property_file` names a pre-compiled automaton
    /// (spec.md Non-goals "no LTL automaton compiler" — the checker only consumes one).
    pub automaton: Option<Automaton>,
}

impl Checker {
    pub fn new(session: Session, config: Config, automaton: Option<Automaton>) -> Self {
        Self {
            config,
            session,
            store: Rc::new(RefCell::new(PageStore::new())),
            automaton,
        }
    }

    /// Takes a full snapshot of the application's current state (spec §4.7).
    pub fn take_snapshot(&self, seq: u64) -> Result<Snapshot> {
        Snapshot::take(self.session.remote(), self.store.clone(), seq, self.config.sparse_checkpoint, self.config.hash)
    }

    /// Runs whichever checker the configuration selects, returning the exit code to report (spec
    /// §6 "exit codes").
    pub fn run(&mut self) -> Result<ExitCode> {
        if self.config.liveness_mode() {
            liveness::run(self)
        } else if self.config.comm_det_mode() {
            commdet::run(self)
        } else {
            safety::run(self)
        }
    }

    /// Resolves a `PropertyViolation`/`UnexpectedExit` error into its exit code and logs the
    /// record trace, matching spec §7's "orderly: print trace, kill app, exit with the
    /// appropriate code" policy.
    pub fn report_violation(&self, code: ExitCode, trace: &[RecordTraceElement]) -> Error {
        log::error!("{code}: {}", format_trace(trace));
        // spec §6 "Persisted state" / §8 S5: the record trace is replay input, so it must land on
        // stdout regardless of logging configuration, not just in the `log` stream.
        println!("{}", format_trace(trace));
        let _ = nix::sys::signal::kill(self.session.pid(), nix::sys::signal::Signal::SIGKILL);
        Error::PropertyViolation(code)
    }
}
