//! Checkpoint-based replay: restores the deepest checkpointed ancestor on the stack and
//! re-executes the recorded transitions of the states in between to bring the application back in
//! sync with the exploration stack's logical position (spec §4.11).

use crate::checker::{Checker, StackFrame};
use crate::error::Result;

/// Restores `stack`'s nearest checkpointed ancestor at or below `target_depth` and replays every
/// `executed_req` between that ancestor and `target_depth` forward, bringing the live application
/// back to the state `stack[target_depth]` represents.
///
/// Called after `Session::restore_segment` would otherwise be needed on every single backtrack;
/// `checkpoint_period` bounds how often a full snapshot is kept (spec §6 `checkpoint_period`), so
/// intervening depths are reconstructed by re-running their recorded transition instead of being
/// separately snapshotted. Generic over [`StackFrame`] so both the safety/comm-det exploration
/// stack and liveness's pair-search stack share one implementation.
pub fn replay_to<T: StackFrame>(checker: &mut Checker, stack: &[T], target_depth: usize) -> Result<()> {
    let has_checkpoint: Vec<bool> = stack.iter().map(|s| s.checkpoint().is_some()).collect();
    let anchor = nearest_checkpointed_ancestor(&has_checkpoint, target_depth);

    let Some(anchor) = anchor else {
        // No checkpoint at or below the target; the root is always checkpointed (`push_state`
        // always takes one when `checkpoint_period == 0`), so this only fires with a
        // `checkpoint_period` large enough to skip depth 0, which `Checker` never configures.
        return Ok(());
    };

    let snapshot = stack[anchor].checkpoint().unwrap().clone();
    snapshot.restore(checker.session.remote())?;
    checker.session.restore_segment(anchor as i32)?;

    for state in &stack[anchor + 1..=target_depth] {
        if let Some(transition) = state.executed_req() {
            checker.session.continue_actor(transition.actor, transition.times_considered)?;
        }
    }
    Ok(())
}

/// The deepest index at or below `target_depth` where `has_checkpoint` is true, if any.
fn nearest_checkpointed_ancestor(has_checkpoint: &[bool], target_depth: usize) -> Option<usize> {
    has_checkpoint[..=target_depth].iter().rposition(|&c| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_deepest_checkpointed_depth_at_or_below_target() {
        let has_checkpoint = vec![true, false, true, false, false];
        assert_eq!(nearest_checkpointed_ancestor(&has_checkpoint, 4), Some(2));
        assert_eq!(nearest_checkpointed_ancestor(&has_checkpoint, 1), Some(0));
    }

    #[test]
    fn none_when_no_ancestor_up_to_target_is_checkpointed() {
        let has_checkpoint = vec![false, false, false];
        assert_eq!(nearest_checkpointed_ancestor(&has_checkpoint, 2), None);
    }
}
