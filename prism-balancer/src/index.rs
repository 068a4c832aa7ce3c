//! Per-tick snapshot of group leadership and placement
//!
//! The index is rebuilt from the [`ClusterView`] before every balancing
//! decision and dropped afterwards. Every group in it has a non-empty replica
//! set, and its leader (when known) is one of those replicas.

use crate::cluster::ClusterView;
use crate::types::{GroupId, Reassignment, Shard};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Leadership and replica placement of one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAssignment {
    /// Current leader, `None` while unknown
    pub leader: Option<Shard>,

    /// Shards eligible to hold leadership
    pub replicas: BTreeSet<Shard>,
}

/// Snapshot mapping every known group to its leader and replicas
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentIndex {
    groups: BTreeMap<GroupId, GroupAssignment>,
}

impl AssignmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group. Groups without replicas are skipped, and a leader that
    /// is not among the replicas is recorded as unknown.
    pub fn insert(
        &mut self,
        group: GroupId,
        replicas: impl IntoIterator<Item = Shard>,
        leader: Option<Shard>,
    ) -> bool {
        let replicas: BTreeSet<Shard> = replicas.into_iter().collect();
        if replicas.is_empty() {
            return false;
        }
        let leader = leader.filter(|shard| replicas.contains(shard));
        self.groups.insert(group, GroupAssignment { leader, replicas });
        true
    }

    pub fn get(&self, group: GroupId) -> Option<&GroupAssignment> {
        self.groups.get(&group)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupId, &GroupAssignment)> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Every shard holding at least one replica
    pub fn shards(&self) -> BTreeSet<Shard> {
        self.groups
            .values()
            .flat_map(|g| g.replicas.iter().copied())
            .collect()
    }

    /// Leader count for every replica-holding shard, zero included
    pub fn leader_counts(&self) -> BTreeMap<Shard, usize> {
        let mut counts: BTreeMap<Shard, usize> =
            self.shards().into_iter().map(|s| (s, 0)).collect();
        for assignment in self.groups.values() {
            if let Some(leader) = assignment.leader {
                *counts.entry(leader).or_insert(0) += 1;
            }
        }
        counts
    }

    /// A move is valid when it starts at the current leader and ends at a
    /// different shard of the replica set.
    pub fn is_valid(&self, reassignment: &Reassignment) -> bool {
        match self.groups.get(&reassignment.group) {
            Some(g) => {
                g.leader == Some(reassignment.from)
                    && reassignment.from != reassignment.to
                    && g.replicas.contains(&reassignment.to)
            }
            None => false,
        }
    }

    /// Apply a move to the snapshot
    pub fn apply(&mut self, reassignment: &Reassignment) -> bool {
        if !self.is_valid(reassignment) {
            return false;
        }
        if let Some(g) = self.groups.get_mut(&reassignment.group) {
            g.leader = Some(reassignment.to);
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct LastKnownLeader {
    from: Shard,
    to: Shard,
    expires: Instant,
}

/// Leaders set by recent transfers, covering gaps and lag in the leader table.
///
/// An entry stands in for the table only while the table reports no leader
/// or still reports the shard the transfer moved away from. Any other leader
/// in the table supersedes it.
#[derive(Debug, Default)]
pub struct LastLeaderCache {
    entries: BTreeMap<GroupId, LastKnownLeader>,
}

impl LastLeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that leadership of `group` moved from `from` to `to`,
    /// until `expires`
    pub fn record(&mut self, group: GroupId, from: Shard, to: Shard, expires: Instant) {
        self.entries
            .insert(group, LastKnownLeader { from, to, expires });
    }

    /// Leader of `group` given what the table reports.
    ///
    /// Expired entries and entries the table has moved past are evicted.
    pub fn resolve(&mut self, group: GroupId, table: Option<Shard>, now: Instant) -> Option<Shard> {
        let Some(entry) = self.entries.get(&group).copied() else {
            return table;
        };
        if now >= entry.expires {
            self.entries.remove(&group);
            return table;
        }
        match table {
            None => Some(entry.to),
            Some(leader) if leader == entry.from => Some(entry.to),
            Some(leader) => {
                if leader != entry.to {
                    trace!(
                        "Group {} leader {} supersedes cached {}",
                        group, leader, entry.to
                    );
                }
                self.entries.remove(&group);
                Some(leader)
            }
        }
    }

    pub fn forget(&mut self, group: GroupId) {
        self.entries.remove(&group);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the index from the cluster view.
///
/// The leader table is authoritative except where [`LastLeaderCache`] covers
/// an unknown leader or a table still lagging behind this balancer's own
/// transfer.
pub fn build_index<V: ClusterView + ?Sized>(
    view: &V,
    cache: &mut LastLeaderCache,
    now: Instant,
) -> AssignmentIndex {
    let mut index = AssignmentIndex::new();

    for group in view.groups() {
        let replicas = view.replica_shards(group);
        if replicas.is_empty() {
            trace!("Skipping group {} with no replicas", group);
            continue;
        }

        let table = view.current_leader(group);
        let leader = match cache.resolve(group, table, now) {
            Some(cached) if Some(cached) != table && !replicas.contains(&cached) => {
                debug!(
                    "Dropping cached leader {} for group {}: no longer a replica",
                    cached, group
                );
                cache.forget(group);
                table
            }
            leader => leader,
        };

        if leader.is_none() {
            trace!("Group {} has no known leader", group);
        }
        index.insert(group, replicas, leader);
    }

    index
}
