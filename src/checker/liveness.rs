//! Liveness checker: depth-first search over `(exploration state, automaton state)` pairs,
//! reporting a violation when a cycle through an accepting pair is found (spec §4.10).
//!
//! This drives the same `next_alternative`/DPOR machinery as [`super::safety`], but each forward
//! step can fan out into several `Pair`s — one per automaton successor satisfied by the freshly
//! re-evaluated proposition values — rather than exactly one successor state.

use std::rc::Rc;

use itertools::Itertools;

use crate::checker::automaton::Automaton;
use crate::checker::replay::replay_to;
use crate::checker::{seed_actor_states, Checker, ExplorationState, RecordTraceElement, StackFrame};
use crate::config::Reduction;
use crate::error::{Error, ExitCode, Result};
use crate::request::{depends, next_alternative, ActorStatus, Transition};
use crate::snapshot::visited::Insertion;
use crate::snapshot::{snapshots_equal, Snapshot, VisitedPair, VisitedSet};

/// One frame of the pair-search stack: an exploration state together with the automaton state
/// reached alongside it, the proposition values that justified reaching it, and the remaining
/// automaton successors this same snapshot still has to fan out into (spec §4.10 "push successor
/// Pairs for every satisfied outgoing transition").
struct PairState {
    exploration: ExplorationState,
    automaton_state: u32,
    accepting: bool,
    propositional_values: Vec<bool>,
    pending_successors: Vec<u32>,
}

impl StackFrame for PairState {
    fn checkpoint(&self) -> Option<&Rc<Snapshot>> {
        self.exploration.checkpoint.as_ref()
    }
    fn executed_req(&self) -> Option<&Transition> {
        self.exploration.executed_req.as_ref()
    }
}

enum Pushed {
    New,
    DeadEnd,
    Deadlock,
    /// A cycle through an accepting pair was found: `automaton_state`/`propositional_values`
    /// match a pair already on the stack that is itself accepting or whose target is.
    Violation,
}

/// Runs the pair-search DFS for every automaton initial state in turn, stopping at the first
/// violation. [`Checker::automaton`] must be `Some`; liveness mode with no automaton configured is
/// a no-op (spec §4.10 implicitly assumes `property_file` was given, matched by
/// [`crate::config::Config::liveness_mode`]).
pub fn run(checker: &mut Checker) -> Result<ExitCode> {
    let Some(automaton) = checker.automaton.clone() else {
        return Ok(ExitCode::NoViolation);
    };
    let dpor = checker.config.reduction == Reduction::Dpor;
    let initial_states: Vec<u32> = automaton.initial_states().map(|s| s.id).collect();

    for &start in &initial_states {
        // Each initial automaton state is an independent root; `visited` dedups within that
        // root's search only (see DESIGN.md: a simplified single-level cycle check rather than
        // the classic two-stack nested-DFS Büchi emptiness algorithm).
        let mut visited: VisitedSet<VisitedPair> = VisitedSet::new(checker.config.visited_max);
        let mut stack: Vec<PairState> = Vec::new();
        let mut trace: Vec<RecordTraceElement> = Vec::new();

        match push_root(checker, &automaton, start, &mut stack, &mut visited)? {
            Pushed::Deadlock => return Err(checker.report_violation(ExitCode::Deadlock, &trace)),
            Pushed::Violation => return Err(checker.report_violation(ExitCode::LivenessViolation, &trace)),
            Pushed::DeadEnd | Pushed::New => {}
        }

        loop {
            if stack.is_empty() {
                break;
            }

            if let Some(next_state) = stack.last_mut().unwrap().pending_successors.pop() {
                // Fan out another automaton successor from the same snapshot before advancing
                // the application at all.
                match push_sibling(&automaton, next_state, &stack)? {
                    Pushed::Violation => return Err(checker.report_violation(ExitCode::LivenessViolation, &trace)),
                    Pushed::Deadlock => return Err(checker.report_violation(ExitCode::Deadlock, &trace)),
                    Pushed::New | Pushed::DeadEnd => {}
                }
                continue;
            }

            let depth = stack.len() as u32;
            let top_todo = stack.last().unwrap().exploration.pick_todo_actor();
            if depth > checker.config.max_depth {
                log::warn!("max_depth ({}) reached at depth {depth}, backtracking", checker.config.max_depth);
            }
            if depth > checker.config.max_depth || top_todo.is_none() {
                backtrack(&mut stack, &mut trace, dpor)?;
                if let Some(top) = stack.len().checked_sub(1) {
                    replay_to(checker, &stack, top)?;
                }
                continue;
            }
            let actor = top_todo.unwrap();

            let pending = checker.session.remote().pending_request(actor)?;
            let top = &mut stack.last_mut().unwrap().exploration;
            let actor_state = top.actor_states.get_mut(&actor).unwrap();
            let Some(transition) = next_alternative(actor, &pending, actor_state) else {
                continue;
            };

            match checker.session.continue_actor(actor, transition.times_considered) {
                Ok(()) => {}
                Err(Error::Protocol(crate::protocol::ProtocolError::AssertionFailure(msg))) => {
                    trace.push(RecordTraceElement { actor, times_considered: transition.times_considered });
                    log::error!("assertion failure: {msg}");
                    return Err(checker.report_violation(ExitCode::SafetyViolation, &trace));
                }
                Err(e) => return Err(e),
            }

            stack.last_mut().unwrap().exploration.executed_req = Some(transition.clone());
            trace.push(RecordTraceElement { actor, times_considered: transition.times_considered });

            match push_forward(checker, &automaton, &mut stack, &mut visited, dpor)? {
                Pushed::New => {}
                Pushed::DeadEnd => {
                    trace.pop();
                    if let Some(top) = stack.len().checked_sub(1) {
                        replay_to(checker, &stack, top)?;
                    }
                }
                Pushed::Deadlock => return Err(checker.report_violation(ExitCode::Deadlock, &trace)),
                Pushed::Violation => return Err(checker.report_violation(ExitCode::LivenessViolation, &trace)),
            }
        }
    }

    Ok(ExitCode::NoViolation)
}

/// Builds the exploration bookkeeping (enabled actors, seeded `ActorState`s) for a freshly taken
/// snapshot, shared by root/sibling/forward pushes.
fn seed_exploration(checker: &Checker, seq: u64, snapshot: &Rc<Snapshot>, dpor: bool) -> ExplorationState {
    let enabled = snapshot.enabled_actors.clone();
    let reduction = if dpor { Reduction::Dpor } else { Reduction::None };
    ExplorationState {
        seq,
        checkpoint: Some(snapshot.clone()),
        actor_states: seed_actor_states(&enabled, reduction),
        executed_req: None,
    }
}

fn cycles_through_accepting(stack: &[PairState], automaton_state: u32, props: &[bool], accepting: bool) -> bool {
    if !accepting {
        return false;
    }
    stack
        .iter()
        .any(|p| p.accepting && p.automaton_state == automaton_state && p.propositional_values == props)
}

fn push_root(
    checker: &mut Checker,
    automaton: &Automaton,
    start: u32,
    stack: &mut Vec<PairState>,
    visited: &mut VisitedSet<VisitedPair>,
) -> Result<Pushed> {
    let seq = visited.next_seq();
    let snapshot = Rc::new(checker.take_snapshot(seq)?);
    let props = checker.session.remote().read_propositions()?;
    let Some(def) = automaton.state(start) else {
        return Ok(Pushed::DeadEnd);
    };
    let exploration = seed_exploration(checker, seq, &snapshot, checker.config.reduction == Reduction::Dpor);
    if exploration.actor_states.values().all(|s| s.status != ActorStatus::Todo) {
        return if checker.session.deadlock_check()? { Ok(Pushed::Deadlock) } else { Ok(Pushed::DeadEnd) };
    }
    stack.push(PairState {
        exploration,
        automaton_state: start,
        accepting: def.accepting,
        propositional_values: props,
        pending_successors: Vec::new(),
    });
    Ok(Pushed::New)
}

/// Pushes another automaton successor reached from the *same* snapshot as the current stack top
/// (spec §4.10 "push successor Pairs for every... transition"), without advancing the application.
/// A sibling never itself holds a checkpoint worth re-exploring from (its parent's checkpoint
/// already covers that snapshot), so it only ever contributes a cycle check.
fn push_sibling(automaton: &Automaton, target: u32, stack: &[PairState]) -> Result<Pushed> {
    let top = stack.last().unwrap();
    let Some(def) = automaton.state(target) else { return Ok(Pushed::DeadEnd) };
    if cycles_through_accepting(stack, target, &top.propositional_values, def.accepting || top.accepting) {
        return Ok(Pushed::Violation);
    }
    Ok(Pushed::DeadEnd)
}

/// Executes the forward step shared by the root push: takes a fresh snapshot after a transition
/// fired, re-evaluates propositions, and fans out into every automaton successor the new
/// proposition values satisfy.
fn push_forward(
    checker: &mut Checker,
    automaton: &Automaton,
    stack: &mut Vec<PairState>,
    visited: &mut VisitedSet<VisitedPair>,
    dpor: bool,
) -> Result<Pushed> {
    let seq = visited.next_seq();
    let snapshot = Rc::new(checker.take_snapshot(seq)?);
    let props = checker.session.remote().read_propositions()?;
    let from_state = stack.last().unwrap().automaton_state;
    // Several guards can be satisfied at once and point at the same target (e.g. an explicit
    // guard alongside a catch-all `True` transition); dedupe so each target is only ever fanned
    // out into the pending-successor list once.
    let successors: Vec<u32> = automaton.satisfied_successors(from_state, &props).unique().collect();
    if successors.is_empty() {
        return Ok(Pushed::DeadEnd);
    }

    let nb_actors = snapshot.nb_actors();
    let heap_bytes_used = snapshot.heap_bytes_used;
    let exploration = seed_exploration(checker, seq, &snapshot, dpor);
    if exploration.actor_states.values().all(|s| s.status != ActorStatus::Todo) {
        return if checker.session.deadlock_check()? { Ok(Pushed::Deadlock) } else { Ok(Pushed::DeadEnd) };
    }

    let mut pending = successors;
    let first = pending.pop().unwrap();
    let Some(def) = automaton.state(first) else { return Ok(Pushed::DeadEnd) };

    if cycles_through_accepting(stack, first, &props, def.accepting) {
        return Ok(Pushed::Violation);
    }

    let candidate = VisitedPair {
        seq,
        nb_actors,
        heap_bytes_used,
        automaton_state: first,
        propositional_values: props.clone(),
        snapshot: Some(snapshot.clone()),
    };
    let stack_ref = &*stack;
    let on_stack = |s: u64| stack_ref.iter().any(|p| p.exploration.seq == s);
    let inserted = visited.insert_if_new(
        candidate,
        |a, b| {
            Ok(a.matches_non_snapshot(b.automaton_state, &b.propositional_values)
                && snapshots_equal(a.snapshot.as_ref().unwrap(), b.snapshot.as_ref().unwrap())?)
        },
        on_stack,
    )?;
    if matches!(inserted, Insertion::AlreadyPresent(_)) {
        return Ok(Pushed::DeadEnd);
    }

    stack.push(PairState {
        exploration,
        automaton_state: first,
        accepting: def.accepting,
        propositional_values: props,
        pending_successors: pending,
    });
    Ok(Pushed::New)
}

fn backtrack(stack: &mut Vec<PairState>, trace: &mut Vec<RecordTraceElement>, dpor: bool) -> Result<()> {
    while let Some(top) = stack.last() {
        if top.exploration.interleave_size() > 0 || !top.pending_successors.is_empty() {
            break;
        }
        let popped = stack.pop().unwrap();
        if !trace.is_empty() {
            trace.pop();
        }
        if dpor {
            if let Some(rc) = &popped.exploration.executed_req {
                for ancestor in stack.iter_mut().rev() {
                    let Some(rp) = ancestor.exploration.executed_req.clone() else { continue };
                    if rp.actor == rc.actor {
                        break;
                    }
                    if depends(&rp, rc) {
                        if let Some(actor_state) = ancestor.exploration.actor_states.get_mut(&rc.actor) {
                            if actor_state.status != ActorStatus::Done {
                                actor_state.status = ActorStatus::Todo;
                            }
                        }
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::automaton::{AutomatonStateDef, AutomatonTransition, Guard};

    #[test]
    fn cycles_through_accepting_matches_same_key_on_stack() {
        let mut stack = Vec::new();
        let exploration = ExplorationState {
            seq: 0,
            checkpoint: None,
            actor_states: Default::default(),
            executed_req: None,
        };
        stack.push(PairState {
            exploration,
            automaton_state: 1,
            accepting: true,
            propositional_values: vec![true],
            pending_successors: Vec::new(),
        });
        assert!(cycles_through_accepting(&stack, 1, &[true], true));
        assert!(!cycles_through_accepting(&stack, 1, &[false], true));
        assert!(!cycles_through_accepting(&stack, 2, &[true], true));
    }

    #[test]
    fn satisfied_successors_of_a_single_state_automaton_self_loop() {
        let automaton = Automaton {
            states: vec![AutomatonStateDef {
                id: 0,
                initial: true,
                accepting: true,
                transitions: vec![(Guard::True, AutomatonTransition { target: 0 })],
            }],
        };
        let succ: Vec<u32> = automaton.satisfied_successors(0, &[]).collect();
        assert_eq!(succ, vec![0]);
    }
}
