//! Group and node cooldowns
//!
//! A muted group or node is left out of the strategy's candidate pool until
//! its entry expires. Expired entries are dropped whenever the muted sets are
//! read, so no background sweep is needed.

use crate::types::{GroupId, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;

/// Cooldown bookkeeping owned by the control loop
#[derive(Debug, Default)]
pub struct MuteTracker {
    groups: BTreeMap<GroupId, Instant>,
    nodes: BTreeMap<NodeId, Instant>,
}

impl MuteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mute `group` until `until`. An existing later expiry is kept.
    pub fn mute_group(&mut self, group: GroupId, until: Instant) {
        extend(&mut self.groups, group, until);
    }

    /// Mute every shard on `node` until `until`. An existing later expiry is kept.
    pub fn mute_node(&mut self, node: NodeId, until: Instant) {
        extend(&mut self.nodes, node, until);
    }

    /// Groups still muted at `now`; expired entries are evicted
    pub fn muted_groups(&mut self, now: Instant) -> BTreeSet<GroupId> {
        live(&mut self.groups, now)
    }

    /// Nodes still muted at `now`; expired entries are evicted
    pub fn muted_nodes(&mut self, now: Instant) -> BTreeSet<NodeId> {
        live(&mut self.nodes, now)
    }

    /// Expiry of a group's cooldown, if any entry is held
    pub fn group_expiry(&self, group: GroupId) -> Option<Instant> {
        self.groups.get(&group).copied()
    }

    pub fn is_group_muted(&self, group: GroupId, now: Instant) -> bool {
        self.groups.get(&group).is_some_and(|until| now < *until)
    }

    /// Drop all cooldowns
    pub fn clear(&mut self) {
        self.groups.clear();
        self.nodes.clear();
    }
}

fn extend<K: Ord>(entries: &mut BTreeMap<K, Instant>, key: K, until: Instant) {
    entries
        .entry(key)
        .and_modify(|current| {
            if until > *current {
                *current = until;
            }
        })
        .or_insert(until);
}

fn live<K: Ord + Copy>(entries: &mut BTreeMap<K, Instant>, now: Instant) -> BTreeSet<K> {
    entries.retain(|_, until| now < *until);
    entries.keys().copied().collect()
}
