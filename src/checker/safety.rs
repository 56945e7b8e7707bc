//! Safety checker: depth-first exploration with optional dynamic partial-order reduction
//! (spec §4.9).

use std::rc::Rc;

use crate::checker::replay::replay_to;
use crate::checker::{seed_actor_states, Checker, ExplorationState, RecordTraceElement};
use crate::config::Reduction;
use crate::error::{Error, ExitCode, Result};
use crate::request::{depends, next_alternative, ActorStatus, Transition};
use crate::snapshot::visited::Insertion;
use crate::snapshot::{snapshots_equal, VisitedSet, VisitedState};

/// Outcome of trying to push the state reached by the most recent transition.
enum Pushed {
    /// A genuinely new state; exploration continues from it.
    New,
    /// Already in `VisitedSet`, or the application reports it isn't actually deadlocked despite
    /// having nothing left enabled — either way there is nothing further to explore from here.
    DeadEnd,
    /// The application confirmed every enabled actor is stuck (spec §4.9, §6 exit code 3).
    Deadlock,
}

/// Runs the safety DFS to exhaustion (or until a violation/deadlock/non-termination is found).
pub fn run(checker: &mut Checker) -> Result<ExitCode> {
    let mut visited: VisitedSet<VisitedState> = VisitedSet::new(checker.config.visited_max);
    let mut stack: Vec<ExplorationState> = Vec::new();
    let mut trace: Vec<RecordTraceElement> = Vec::new();
    let dpor = checker.config.reduction == Reduction::Dpor;

    match push_state(checker, &mut stack, &mut visited, dpor)? {
        Pushed::Deadlock => return Err(checker.report_violation(ExitCode::Deadlock, &trace)),
        Pushed::DeadEnd | Pushed::New => {}
    }

    loop {
        if stack.is_empty() {
            return Ok(ExitCode::NoViolation);
        }

        let depth = stack.len() as u32;
        let top_todo = stack.last().unwrap().pick_todo_actor();

        if depth > checker.config.max_depth {
            log::warn!("max_depth ({}) reached at depth {depth}, backtracking", checker.config.max_depth);
        }
        if depth > checker.config.max_depth || top_todo.is_none() {
            backtrack(&mut stack, &mut trace, dpor)?;
            if let Some(new_top) = stack.len().checked_sub(1) {
                replay_to(checker, &stack, new_top)?;
            }
            continue;
        }
        let actor = top_todo.unwrap();

        let pending = checker.session.remote().pending_request(actor)?;
        let top = stack.last_mut().unwrap();
        let actor_state = top.actor_states.get_mut(&actor).unwrap();
        let Some(transition) = next_alternative(actor, &pending, actor_state) else {
            // Nothing fired; the next loop iteration picks another `Todo` actor or backtracks.
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

        stack.last_mut().unwrap().executed_req = Some(transition.clone());
        trace.push(RecordTraceElement { actor, times_considered: transition.times_considered });

        match push_state(checker, &mut stack, &mut visited, dpor)? {
            Pushed::New => {
                if checker.config.termination && top_of_stack_revisits_ancestor(&stack)? {
                    return Err(checker.report_violation(ExitCode::NonTermination, &trace));
                }
            }
            Pushed::DeadEnd => {
                trace.pop();
                // The application already advanced into this (already-visited) state; resync it
                // back to the state the exploration stack still considers current before trying
                // another alternative from there.
                if let Some(top) = stack.len().checked_sub(1) {
                    replay_to(checker, &stack, top)?;
                }
            }
            Pushed::Deadlock => {
                return Err(checker.report_violation(ExitCode::Deadlock, &trace));
            }
        }
    }
}

/// Takes a snapshot of the application's current state, checks it against the visited set, and
/// pushes a fresh `ExplorationState` if it is new (spec §4.9 "Forward step").
fn push_state(
    checker: &mut Checker,
    stack: &mut Vec<ExplorationState>,
    visited: &mut VisitedSet<VisitedState>,
    dpor: bool,
) -> Result<Pushed> {
    let seq = visited.next_seq();
    let snapshot = checker.take_snapshot(seq)?;
    let enabled = snapshot.enabled_actors.clone();
    let nb_actors = snapshot.nb_actors();
    let heap_bytes_used = snapshot.heap_bytes_used;
    let snapshot = Rc::new(snapshot);

    let reduction = if dpor { Reduction::Dpor } else { Reduction::None };
    let actor_states = seed_actor_states(&enabled, reduction);

    if actor_states.values().all(|s| s.status != ActorStatus::Todo) {
        return if checker.session.deadlock_check()? {
            Ok(Pushed::Deadlock)
        } else {
            // E.g. the application is merely waiting on a timer the checker cannot see.
            Ok(Pushed::DeadEnd)
        };
    }

    let candidate = VisitedState {
        seq,
        nb_actors,
        heap_bytes_used,
        snapshot: Some(snapshot.clone()),
    };
    let stack_ref = &*stack;
    let on_stack = |s: u64| stack_ref.iter().any(|e| e.seq == s);
    let inserted = visited.insert_if_new(
        candidate,
        |a, b| snapshots_equal(a.snapshot.as_ref().unwrap(), b.snapshot.as_ref().unwrap()),
        on_stack,
    )?;

    match inserted {
        Insertion::AlreadyPresent(_) => Ok(Pushed::DeadEnd),
        Insertion::New => {
            let checkpoint = if checker.config.checkpoint_period == 0
                || stack.len() as u32 % checker.config.checkpoint_period == 0
            {
                Some(snapshot)
            } else {
                None
            };
            stack.push(ExplorationState {
                seq,
                checkpoint,
                actor_states,
                executed_req: None,
            });
            Ok(Pushed::New)
        }
    }
}

/// Non-termination check: the freshly-pushed top state's checkpoint snapshot equals some
/// ancestor's (spec §4.9 "if non-termination checking is on and `s'`'s snapshot equals some
/// ancestor on `S`, report NonTermination"). Only checkpointed depths can be compared this way;
/// an un-checkpointed depth simply isn't checked.
fn top_of_stack_revisits_ancestor(stack: &[ExplorationState]) -> Result<bool> {
    let Some((top, ancestors)) = stack.split_last() else { return Ok(false) };
    let Some(top_snapshot) = &top.checkpoint else { return Ok(false) };
    for ancestor in ancestors {
        if let Some(snap) = &ancestor.checkpoint {
            if snapshots_equal(top_snapshot, snap)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Pops states whose remaining interleave is empty; for each popped state `c` (under DPOR),
/// scans ancestors from top to bottom re-enabling the alternative interleaving where a
/// dependency with `c`'s transition is found (spec §4.9 "Backtrack").
fn backtrack(stack: &mut Vec<ExplorationState>, trace: &mut Vec<RecordTraceElement>, dpor: bool) -> Result<()> {
    while let Some(top) = stack.last() {
        if top.interleave_size() > 0 {
            break;
        }
        let popped = stack.pop().unwrap();
        if !trace.is_empty() {
            trace.pop();
        }

        if dpor {
            if let Some(rc) = &popped.executed_req {
                for ancestor in stack.iter_mut().rev() {
                    let Some(rp) = ancestor.executed_req.clone() else { continue };
                    if rp.actor == rc.actor {
                        break;
                    }
                    if depends(&rp, rc) {
                        if let Some(actor_state) = ancestor.actor_states.get_mut(&rc.actor) {
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
    use crate::request::{ActorState, TransitionKind};
    use std::collections::BTreeMap;

    fn leaf(actor: u64, kind: TransitionKind) -> ExplorationState {
        let mut actor_states = BTreeMap::new();
        actor_states.insert(actor, ActorState { status: ActorStatus::Done, times_considered: 1 });
        ExplorationState {
            seq: 0,
            checkpoint: None,
            actor_states,
            executed_req: Some(Transition::new(actor, kind)),
        }
    }

    #[test]
    fn backtrack_re_enables_the_dependent_ancestor_and_stops_scanning() {
        let mut near = leaf(1, TransitionKind::CommSend { comm: 1, mbox: 1, sbuf: 0, size: 8, tag: 0 });
        near.actor_states.insert(2, ActorState { status: ActorStatus::Done, times_considered: 1 });
        let mut stack = vec![near];
        let mut trace = vec![RecordTraceElement { actor: 2, times_considered: 0 }];

        // Pop a leaf whose executed transition (a send on the same mailbox, different actor)
        // depends on `near`'s send — `near`'s actor 2 should flip back to `Todo`.
        let popped = leaf(2, TransitionKind::CommSend { comm: 2, mbox: 1, sbuf: 0, size: 8, tag: 0 });
        stack.push(popped);
        backtrack(&mut stack, &mut trace, true).unwrap();

        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].actor_states[&2].status, ActorStatus::Todo);
    }

    #[test]
    fn backtrack_stops_at_the_first_same_actor_ancestor() {
        let mut near = leaf(1, TransitionKind::CommSend { comm: 1, mbox: 1, sbuf: 0, size: 8, tag: 0 });
        near.actor_states.insert(2, ActorState { status: ActorStatus::Done, times_considered: 1 });
        let mut stack = vec![near];
        let mut trace = vec![RecordTraceElement { actor: 1, times_considered: 0 }];

        // Popped transition shares actor 1 with `near`'s own transition, so the scan stops
        // without touching actor 2.
        let popped = leaf(1, TransitionKind::CommSend { comm: 2, mbox: 1, sbuf: 0, size: 8, tag: 0 });
        stack.push(popped);
        backtrack(&mut stack, &mut trace, true).unwrap();

        assert_eq!(stack[0].actor_states[&2].status, ActorStatus::Done);
    }
}
