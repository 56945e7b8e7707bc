//! The checker's configuration surface.
//!
//! Parsing this struct out of argv or a TOML file is explicitly out of scope (spec §1): the core
//! only consumes an already-built [`Config`]. The struct still derives `serde::Deserialize` so an
//! external CLI front-end can produce one without the core caring how.

use std::path::PathBuf;

use serde::Deserialize;

/// Safety-exploration reduction strategy (spec §4.9).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Consider every enabled actor at every state.
    None,
    /// One enabled actor per state, with dependency-driven re-enabling during backtrack.
    #[default]
    Dpor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backtrack once the exploration stack reaches this depth.
    pub max_depth: u32,
    /// Bound on `VisitedSet` size, 0 = unbounded.
    pub visited_max: i32,
    /// Keep a full snapshot every N states, 0 = never (always snapshot).
    pub checkpoint_period: u32,
    /// Safety-exploration reduction strategy.
    pub reduction: Reduction,
    /// Enable non-progressive-cycle (non-termination) detection.
    pub termination: bool,
    /// Enable the communication-determinism checker (recv order included).
    pub comms_determinism: bool,
    /// Enable the send-determinism checker (send order only).
    pub send_determinism: bool,
    /// Selects liveness mode with this LTL automaton description.
    pub property_file: Option<PathBuf>,
    /// Compute and compare snapshot content hashes.
    pub hash: bool,
    /// Use PageStore/Chunked regions instead of Flat regions.
    pub sparse_checkpoint: bool,
    /// Emit the explored state graph here.
    pub dot_output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_depth: 1000,
            visited_max: 0,
            checkpoint_period: 0,
            reduction: Reduction::Dpor,
            termination: false,
            comms_determinism: false,
            send_determinism: false,
            property_file: None,
            hash: false,
            sparse_checkpoint: false,
            dot_output: None,
        }
    }
}

impl Config {
    /// True if liveness mode was selected (a property file is set).
    pub fn liveness_mode(&self) -> bool {
        self.property_file.is_some()
    }

    /// True if either determinism flag requires the comm-determinism checker to run.
    pub fn comm_det_mode(&self) -> bool {
        self.comms_determinism || self.send_determinism
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_cli_surface() {
        let cfg = Config::default();
        assert_eq!(cfg.max_depth, 1000);
        assert_eq!(cfg.visited_max, 0);
        assert_eq!(cfg.checkpoint_period, 0);
        assert_eq!(cfg.reduction, Reduction::Dpor);
        assert!(!cfg.liveness_mode());
        assert!(!cfg.comm_det_mode());
    }
}
