//! The already-compiled LTL property automaton the liveness checker drives (spec §4.10).
//!
//! Compiling an LTL formula into this automaton is explicitly out of scope (spec.md Non-goals
//! "no LTL automaton compiler"); the core only consumes one, the same way it consumes an
//! already-parsed [`crate::config::Config`].

/// A guard over the application's propositional variables (spec §4.10 "whose label is satisfied
/// by the new proposition values"). LTL-to-Büchi compilation commonly yields guards in exactly
/// this shape: a small monotone boolean formula over atomic-proposition indices.
#[derive(Debug, Clone, serde::Deserialize)]
pub enum Guard {
    True,
    Var(usize),
    Not(Box<Guard>),
    And(Box<Guard>, Box<Guard>),
    Or(Box<Guard>, Box<Guard>),
}

impl Guard {
    pub fn eval(&self, props: &[bool]) -> bool {
        match self {
            Guard::True => true,
            Guard::Var(i) => props.get(*i).copied().unwrap_or(false),
            Guard::Not(g) => !g.eval(props),
            Guard::And(a, b) => a.eval(props) && b.eval(props),
            Guard::Or(a, b) => a.eval(props) || b.eval(props),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct AutomatonTransition {
    pub target: u32,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AutomatonStateDef {
    pub id: u32,
    pub initial: bool,
    pub accepting: bool,
    /// Each outgoing transition's guard, paired with its target state id.
    pub transitions: Vec<(Guard, AutomatonTransition)>,
}

/// A property automaton: a fixed set of states, each with outgoing guarded transitions. Loaded
/// from the already-compiled form named by `Config::property_file` (spec.md Non-goals "no LTL
/// automaton compiler" — only deserializing pre-built data is this crate's job, the same way
/// `Config` itself is `Deserialize` rather than argv-parsed internally).
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Automaton {
    pub states: Vec<AutomatonStateDef>,
}

impl Automaton {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

impl Automaton {
    pub fn initial_states(&self) -> impl Iterator<Item = &AutomatonStateDef> {
        self.states.iter().filter(|s| s.initial)
    }

    pub fn state(&self, id: u32) -> Option<&AutomatonStateDef> {
        self.states.iter().find(|s| s.id == id)
    }

    /// Every successor state reachable from `from` whose guard the current proposition values
    /// satisfy (spec §4.10 "for every automaton outgoing transition whose label is satisfied").
    pub fn satisfied_successors<'a>(&'a self, from: u32, props: &'a [bool]) -> impl Iterator<Item = u32> + 'a {
        self.state(from)
            .into_iter()
            .flat_map(move |s| s.transitions.iter())
            .filter(move |(guard, _)| guard.eval(props))
            .map(|(_, t)| t.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_combinators_evaluate_correctly() {
        let props = vec![true, false];
        assert!(Guard::Var(0).eval(&props));
        assert!(!Guard::Var(1).eval(&props));
        assert!(Guard::Not(Box::new(Guard::Var(1))).eval(&props));
        assert!(Guard::And(Box::new(Guard::Var(0)), Box::new(Guard::Not(Box::new(Guard::Var(1))))).eval(&props));
        assert!(!Guard::And(Box::new(Guard::Var(0)), Box::new(Guard::Var(1))).eval(&props));
    }

    #[test]
    fn satisfied_successors_filters_by_guard() {
        let automaton = Automaton {
            states: vec![AutomatonStateDef {
                id: 0,
                initial: true,
                accepting: false,
                transitions: vec![
                    (Guard::Var(0), AutomatonTransition { target: 1 }),
                    (Guard::Not(Box::new(Guard::Var(0))), AutomatonTransition { target: 2 }),
                ],
            }],
        };
        let succ: Vec<u32> = automaton.satisfied_successors(0, &[true]).collect();
        assert_eq!(succ, vec![1]);
    }
}
