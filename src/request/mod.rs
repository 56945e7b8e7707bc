//! Simcall scheduling: transitions, the dependence predicate, and per-actor request iteration
//! (spec §4.8).

mod dependence;

pub use dependence::depends;

pub type ActorId = u64;
pub type CommId = u64;
pub type MboxId = u64;

/// One concrete simcall an actor can be asked to execute (spec §4.8 `TransitionKind`).
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionKind {
    CommSend {
        comm: CommId,
        mbox: MboxId,
        sbuf: u64,
        size: u64,
        tag: i32,
    },
    CommRecv {
        comm: CommId,
        mbox: MboxId,
        rbuf: u64,
        tag: i32,
    },
    CommWait {
        comm: CommId,
        sender: ActorId,
        receiver: ActorId,
        mbox: MboxId,
        sbuf: u64,
        rbuf: u64,
        size: u64,
        timeout: bool,
    },
    CommTest {
        comm: CommId,
        sender: ActorId,
        receiver: ActorId,
        mbox: MboxId,
        sbuf: u64,
        rbuf: u64,
        size: u64,
    },
    TestAny {
        transitions: Vec<TransitionKind>,
    },
    WaitAny {
        transitions: Vec<TransitionKind>,
    },
    Random {
        min: i64,
        max: i64,
    },
    Unknown,
}

impl TransitionKind {
    /// The canonicalization order `depends` uses to decide which side of a pair to treat as `a`
    /// (spec §4.8 "Canonicalize: if `b.kind_order < a.kind_order`, swap").
    fn kind_order(&self) -> u8 {
        match self {
            TransitionKind::CommSend { .. } => 0,
            TransitionKind::CommRecv { .. } => 1,
            TransitionKind::CommWait { .. } => 2,
            TransitionKind::CommTest { .. } => 3,
            TransitionKind::TestAny { .. } => 4,
            TransitionKind::WaitAny { .. } => 5,
            TransitionKind::Random { .. } => 6,
            TransitionKind::Unknown => 7,
        }
    }
}

/// A simcall attributed to one actor, with the iteration counter DPOR/backtrack use to resume
/// enumerating `WaitAny`/`TestAny`/`Random` alternatives (spec §4.8 `Transition`).
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub actor: ActorId,
    pub times_considered: i32,
    pub kind: TransitionKind,
}

impl Transition {
    pub fn new(actor: ActorId, kind: TransitionKind) -> Self {
        Self {
            actor,
            times_considered: 0,
            kind,
        }
    }
}

/// Status of one actor within a single `State` (spec §3 `ActorState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStatus {
    Disabled,
    Todo,
    Done,
}

#[derive(Debug, Clone)]
pub struct ActorState {
    pub status: ActorStatus,
    pub times_considered: u32,
}

impl Default for ActorState {
    fn default() -> Self {
        Self {
            status: ActorStatus::Disabled,
            times_considered: 0,
        }
    }
}

/// Advances one actor's pending-simcall iteration and returns the next `Transition` to try, or
/// `None` once every alternative for this simcall has been exhausted (spec §4.8).
///
/// `pending` is the simcall the application reported as next for this actor; for `WaitAny` /
/// `TestAny` / `Random` the iteration is over the sub-transitions / integer range rather than a
/// single fixed shape.
pub fn next_alternative(actor: ActorId, pending: &TransitionKind, state: &mut ActorState) -> Option<Transition> {
    let times = state.times_considered;
    let chosen = match pending {
        TransitionKind::WaitAny { transitions } | TransitionKind::TestAny { transitions } => {
            transitions.get(times as usize).cloned()
        }
        TransitionKind::Random { min, max } => {
            let value = min + times as i64;
            if value > *max {
                None
            } else {
                Some(TransitionKind::Random { min: value, max: value })
            }
        }
        other => {
            if times == 0 {
                Some(other.clone())
            } else {
                None
            }
        }
    };

    match chosen {
        Some(kind) => {
            state.times_considered += 1;
            Some(Transition {
                actor,
                times_considered: times as i32,
                kind,
            })
        }
        None => {
            state.status = ActorStatus::Done;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shape_simcall_is_exhausted_after_one_alternative() {
        let mut st = ActorState::default();
        let pending = TransitionKind::CommSend { comm: 1, mbox: 1, sbuf: 0, size: 8, tag: 0 };
        assert!(next_alternative(1, &pending, &mut st).is_some());
        assert!(next_alternative(1, &pending, &mut st).is_none());
        assert_eq!(st.status, ActorStatus::Done);
    }

    #[test]
    fn random_enumerates_inclusive_range() {
        let mut st = ActorState::default();
        let pending = TransitionKind::Random { min: 2, max: 4 };
        let mut seen = Vec::new();
        while let Some(t) = next_alternative(1, &pending, &mut st) {
            if let TransitionKind::Random { min, .. } = t.kind {
                seen.push(min);
            }
        }
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn waitany_enumerates_each_sub_transition_once() {
        let mut st = ActorState::default();
        let pending = TransitionKind::WaitAny {
            transitions: vec![
                TransitionKind::CommRecv { comm: 1, mbox: 1, rbuf: 0, tag: 0 },
                TransitionKind::CommRecv { comm: 2, mbox: 2, rbuf: 0, tag: 0 },
            ],
        };
        let mut count = 0;
        while next_alternative(1, &pending, &mut st).is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
