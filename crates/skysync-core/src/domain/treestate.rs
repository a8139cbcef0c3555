//! Scheduling flags that steer tree traversal.
//!
//! Every sync node carries a handful of these four-state flags (`scan_again`,
//! `sync_again`, `use_blocked`, `scan_blocked`, `conflicts`). They let a pass
//! skip entire subtrees: a parent only descends where a flag says work is
//! waiting below.
//!
//! The states form a ladder. Raising a node to `ActionHere` or
//! `ActionSubtree` walks to the root raising each ancestor to at least
//! `DescendantFlagged`; after a level is processed, the parent's flag is
//! recomputed from its children so resolved subtrees fall back to
//! `Resolved`.

use serde::{Deserialize, Serialize};

/// Per-node work flag.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TreeState {
    /// Nothing to do at this node or below.
    #[default]
    Resolved = 0,
    /// Some descendant needs attention; this level itself is fine.
    DescendantFlagged = 1,
    /// Work is needed at this node (children may also carry flags).
    ActionHere = 2,
    /// Work is needed at this node and at every node below it.
    ActionSubtree = 3,
}

impl TreeState {
    /// True when this node itself needs processing.
    pub fn needs_action(self) -> bool {
        self >= TreeState::ActionHere
    }

    /// True when this node or anything below it needs processing.
    pub fn pending(self) -> bool {
        self != TreeState::Resolved
    }
}

/// Upward aggregation: a resolved parent learns that a child still has
/// pending work.
pub fn update_from_child(parent: TreeState, child: TreeState) -> TreeState {
    if parent == TreeState::Resolved && child != TreeState::Resolved {
        TreeState::DescendantFlagged
    } else {
        parent
    }
}

/// Downward propagation: a subtree-wide action overrides whatever the child
/// had, so the whole subtree is processed.
pub fn propagate_subtree(parent: TreeState, child: TreeState) -> TreeState {
    if parent == TreeState::ActionSubtree {
        TreeState::ActionSubtree
    } else {
        child
    }
}

#[cfg(test)]
mod tests {
    use super::TreeState::*;
    use super::*;

    #[test]
    fn test_ordering_matches_ladder() {
        assert!(Resolved < DescendantFlagged);
        assert!(DescendantFlagged < ActionHere);
        assert!(ActionHere < ActionSubtree);
    }

    #[test]
    fn test_update_from_child_raises_resolved_parent() {
        assert_eq!(update_from_child(Resolved, ActionHere), DescendantFlagged);
        assert_eq!(update_from_child(Resolved, DescendantFlagged), DescendantFlagged);
        assert_eq!(update_from_child(Resolved, Resolved), Resolved);
    }

    #[test]
    fn test_update_from_child_keeps_stronger_parent() {
        assert_eq!(update_from_child(ActionHere, Resolved), ActionHere);
        assert_eq!(update_from_child(ActionSubtree, ActionHere), ActionSubtree);
        assert_eq!(update_from_child(DescendantFlagged, Resolved), DescendantFlagged);
    }

    #[test]
    fn test_propagate_subtree_overrides_child() {
        assert_eq!(propagate_subtree(ActionSubtree, Resolved), ActionSubtree);
        assert_eq!(propagate_subtree(ActionSubtree, ActionHere), ActionSubtree);
    }

    #[test]
    fn test_propagate_non_subtree_leaves_child_alone() {
        assert_eq!(propagate_subtree(ActionHere, Resolved), Resolved);
        assert_eq!(propagate_subtree(Resolved, DescendantFlagged), DescendantFlagged);
    }

    #[test]
    fn test_needs_action_threshold() {
        assert!(!Resolved.needs_action());
        assert!(!DescendantFlagged.needs_action());
        assert!(ActionHere.needs_action());
        assert!(ActionSubtree.needs_action());
        assert!(DescendantFlagged.pending());
    }
}
