//! Communication-determinism checker: the same DFS shape as [`super::safety`], but DPOR-free
//! (every enabled actor is always `Todo`), recording per-mailbox communication order and
//! comparing it whenever two different interleavings reach the same `(nb_actors,
//! heap_bytes_used)` bucket (SPEC_FULL.md §4.9–4.11 supplement: `--cfg=smpi-data-exchange:on`
//! style checking, generalized from the original's fixed MPI-specific terminology).

use std::collections::HashMap;
use std::rc::Rc;

use crate::checker::replay::replay_to;
use crate::checker::{seed_actor_states, Checker, ExplorationState, RecordTraceElement};
use crate::config::Reduction;
use crate::error::{Error, ExitCode, Result};
use crate::request::{next_alternative, ActorStatus, MboxId, Transition, TransitionKind};
use crate::snapshot::visited::Insertion;
use crate::snapshot::{snapshots_equal, VisitedSet, VisitedState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommEvent {
    Send { actor: u64, tag: i32, size: u64 },
    Recv { actor: u64, tag: i32 },
}

/// The ordered per-mailbox communication pattern observed along one path from the root to a
/// given state, used as the comparison key for a `(nb_actors, heap_bytes_used)` bucket.
type MailboxHistory = std::collections::BTreeMap<MboxId, Vec<CommEvent>>;

fn comm_event(mbox_transition: &Transition, comms_determinism: bool) -> Option<(MboxId, CommEvent)> {
    match &mbox_transition.kind {
        TransitionKind::CommSend { mbox, tag, size, .. } => {
            Some((*mbox, CommEvent::Send { actor: mbox_transition.actor, tag: *tag, size: *size }))
        }
        TransitionKind::CommRecv { mbox, tag, .. } if comms_determinism => {
            Some((*mbox, CommEvent::Recv { actor: mbox_transition.actor, tag: *tag }))
        }
        _ => None,
    }
}

enum Pushed {
    New,
    DeadEnd,
    Deadlock,
}

/// Runs the communication-determinism DFS to exhaustion, or until conflicting mailbox orderings
/// are found reaching the same bucket.
pub fn run(checker: &mut Checker) -> Result<ExitCode> {
    let comms_determinism = checker.config.comms_determinism;
    let mut visited: VisitedSet<VisitedState> = VisitedSet::new(checker.config.visited_max);
    let mut stack: Vec<ExplorationState> = Vec::new();
    // One slot per stack depth: the mailbox event the transition landing on that depth produced,
    // or `None` for events irrelevant to the mode in effect (e.g. a receive under
    // `send_determinism`).
    let mut events: Vec<Option<(MboxId, CommEvent)>> = Vec::new();
    let mut trace: Vec<RecordTraceElement> = Vec::new();
    let mut recorded: HashMap<(usize, u64), MailboxHistory> = HashMap::new();

    match push_state(checker, &mut stack, &mut events, &mut visited, &mut recorded, &trace)? {
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
            backtrack(&mut stack, &mut events, &mut trace);
            if let Some(top) = stack.len().checked_sub(1) {
                replay_to(checker, &stack, top)?;
            }
            continue;
        }
        let actor = top_todo.unwrap();

        let pending = checker.session.remote().pending_request(actor)?;
        let top = stack.last_mut().unwrap();
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

        stack.last_mut().unwrap().executed_req = Some(transition.clone());
        events.push(comm_event(&transition, comms_determinism));
        trace.push(RecordTraceElement { actor, times_considered: transition.times_considered });

        match push_state(checker, &mut stack, &mut events, &mut visited, &mut recorded, &trace)? {
            Pushed::New => {}
            Pushed::DeadEnd => {
                trace.pop();
                events.pop();
                if let Some(top) = stack.len().checked_sub(1) {
                    replay_to(checker, &stack, top)?;
                }
            }
            Pushed::Deadlock => return Err(checker.report_violation(ExitCode::Deadlock, &trace)),
        }
    }
}

fn push_state(
    checker: &mut Checker,
    stack: &mut Vec<ExplorationState>,
    events: &mut Vec<Option<(MboxId, CommEvent)>>,
    visited: &mut VisitedSet<VisitedState>,
    recorded: &mut HashMap<(usize, u64), MailboxHistory>,
    trace: &[RecordTraceElement],
) -> Result<Pushed> {
    let seq = visited.next_seq();
    let snapshot = checker.take_snapshot(seq)?;
    let enabled = snapshot.enabled_actors.clone();
    let nb_actors = snapshot.nb_actors();
    let heap_bytes_used = snapshot.heap_bytes_used;
    let snapshot = Rc::new(snapshot);

    let actor_states = seed_actor_states(&enabled, Reduction::None);
    if actor_states.values().all(|s| s.status != ActorStatus::Todo) {
        return if checker.session.deadlock_check()? { Ok(Pushed::Deadlock) } else { Ok(Pushed::DeadEnd) };
    }

    let history = history_along_path(events);
    let bucket = (nb_actors, heap_bytes_used);
    match recorded.get(&bucket) {
        Some(existing) if *existing != history => {
            log::error!("conflicting mailbox orderings reaching the same state: {existing:?} vs {history:?}");
            return Err(checker.report_violation(ExitCode::NonDeterminism, trace));
        }
        Some(_) => {}
        None => {
            recorded.insert(bucket, history);
        }
    }

    let candidate = VisitedState { seq, nb_actors, heap_bytes_used, snapshot: Some(snapshot.clone()) };
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
            stack.push(ExplorationState { seq, checkpoint: Some(snapshot), actor_states, executed_req: None });
            Ok(Pushed::New)
        }
    }
}

/// Folds the per-depth events recorded so far into the ordered per-mailbox history a comparison
/// needs.
fn history_along_path(events: &[Option<(MboxId, CommEvent)>]) -> MailboxHistory {
    let mut history: MailboxHistory = MailboxHistory::new();
    for (mbox, event) in events.iter().flatten() {
        history.entry(*mbox).or_default().push(*event);
    }
    history
}

fn backtrack(stack: &mut Vec<ExplorationState>, events: &mut Vec<Option<(MboxId, CommEvent)>>, trace: &mut Vec<RecordTraceElement>) {
    while let Some(top) = stack.last() {
        if top.interleave_size() > 0 {
            break;
        }
        stack.pop();
        if !trace.is_empty() {
            trace.pop();
            events.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_groups_events_by_mailbox_in_order() {
        let events = vec![
            Some((1, CommEvent::Send { actor: 1, tag: 0, size: 8 })),
            Some((2, CommEvent::Send { actor: 2, tag: 0, size: 8 })),
            Some((1, CommEvent::Recv { actor: 3, tag: 0 })),
            None,
        ];
        let history = history_along_path(&events);
        assert_eq!(history[&1].len(), 2);
        assert_eq!(history[&2].len(), 1);
    }

    #[test]
    fn send_only_mode_ignores_receives() {
        let transition = Transition::new(1, TransitionKind::CommRecv { comm: 1, mbox: 5, rbuf: 0, tag: 0 });
        assert!(comm_event(&transition, false).is_none());
        assert!(comm_event(&transition, true).is_some());
    }
}
