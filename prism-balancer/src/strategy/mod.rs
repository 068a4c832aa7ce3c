//! Balancing strategies
//!
//! A strategy looks at an [`AssignmentIndex`] and the current exclusions and
//! proposes at most one leadership move that strictly improves its balance
//! metric. Returning `None` means no such move exists, which ends the tick.
//!
//! Strategies are pure: identical inputs always give the same answer.

mod greedy;

pub use greedy::{GreedyBalancedNodes, GreedyBalancedShards};

use crate::config::StrategyKind;
use crate::index::AssignmentIndex;
use crate::types::{GroupId, NodeId, Reassignment};
use std::collections::BTreeSet;

/// Computes the next leadership move
pub trait BalancingStrategy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Best improving move, or `None` at the fixpoint.
    ///
    /// Never proposes a muted group, a shard on a muted node (as source or
    /// destination), a self-move, or a destination outside the replica set.
    fn compute_reassignment(
        &self,
        index: &AssignmentIndex,
        muted_groups: &BTreeSet<GroupId>,
        muted_nodes: &BTreeSet<NodeId>,
    ) -> Option<Reassignment>;

    /// Spread between the most and least loaded unmuted units
    fn imbalance(&self, index: &AssignmentIndex, muted_nodes: &BTreeSet<NodeId>) -> usize;
}

impl StrategyKind {
    /// Build the strategy this kind names
    pub fn build(self) -> Box<dyn BalancingStrategy> {
        match self {
            StrategyKind::GreedyBalancedShards => Box::new(GreedyBalancedShards),
            StrategyKind::GreedyBalancedNodes => Box::new(GreedyBalancedNodes),
        }
    }
}
