//! In-memory cluster metadata
//!
//! Tracks nodes, group replica sets, group leaders and controller
//! leadership, and broadcasts leadership changes. Hosts that keep this
//! information elsewhere implement [`ClusterView`] directly instead.

use super::ClusterView;
use crate::error::{BalancerError, Result};
use crate::types::{GroupId, LeadershipEvent, NodeId, Shard};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// Placement and leadership of a single group
#[derive(Debug, Clone)]
struct GroupState {
    replicas: Vec<Shard>,
    leader: Option<Shard>,
}

/// Cluster-wide metadata shared between the metadata writer and readers
#[derive(Debug)]
pub struct ClusterMetadata {
    /// This node
    local_node: NodeId,

    /// Known nodes and their last heartbeat
    nodes: RwLock<BTreeMap<NodeId, Option<Instant>>>,

    /// Groups by id
    groups: RwLock<BTreeMap<GroupId, GroupState>>,

    /// Whether this node is the controller leader
    controller_leader: RwLock<bool>,

    /// Whether the next barrier succeeds
    barrier_ok: RwLock<bool>,

    event_tx: broadcast::Sender<LeadershipEvent>,
}

impl ClusterMetadata {
    /// Create empty metadata as seen from `local_node`
    pub fn new(local_node: NodeId) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        let mut nodes = BTreeMap::new();
        nodes.insert(local_node, None);
        Self {
            local_node,
            nodes: RwLock::new(nodes),
            groups: RwLock::new(BTreeMap::new()),
            controller_leader: RwLock::new(false),
            barrier_ok: RwLock::new(true),
            event_tx,
        }
    }

    /// The node this metadata belongs to
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    // ========================================
    // Node Management
    // ========================================

    /// Register a node with a fresh heartbeat
    pub fn register_node(&self, node_id: NodeId) {
        let heartbeat = if node_id == self.local_node {
            None
        } else {
            Some(Instant::now())
        };
        self.nodes.write().insert(node_id, heartbeat);
    }

    /// Record a heartbeat received now
    pub fn record_heartbeat(&self, node_id: NodeId) -> bool {
        self.set_last_heartbeat(node_id, Instant::now())
    }

    /// Record a heartbeat received at a specific instant
    pub fn set_last_heartbeat(&self, node_id: NodeId, at: Instant) -> bool {
        if node_id == self.local_node {
            return false;
        }
        match self.nodes.write().get_mut(&node_id) {
            Some(heartbeat) => {
                *heartbeat = Some(at);
                true
            }
            None => false,
        }
    }

    /// Remove a node from the cluster
    pub fn remove_node(&self, node_id: NodeId) -> bool {
        self.nodes.write().remove(&node_id).is_some()
    }

    // ========================================
    // Group Management
    // ========================================

    /// Add or replace a group with its replica set and leader
    pub fn upsert_group(&self, group: GroupId, replicas: Vec<Shard>, leader: Option<Shard>) {
        {
            let mut nodes = self.nodes.write();
            for replica in &replicas {
                if !nodes.contains_key(&replica.node_id) {
                    let heartbeat = (replica.node_id != self.local_node).then(Instant::now);
                    nodes.insert(replica.node_id, heartbeat);
                }
            }
        }
        self.groups
            .write()
            .insert(group, GroupState { replicas, leader });
        self.notify(LeadershipEvent::GroupLeaderChanged { group, leader });
    }

    /// Remove a group
    pub fn remove_group(&self, group: GroupId) -> bool {
        self.groups.write().remove(&group).is_some()
    }

    /// Change the leader of a group and notify subscribers.
    ///
    /// A leader must hold a replica of the group.
    pub fn set_leader(&self, group: GroupId, leader: Option<Shard>) -> Result<()> {
        {
            let mut groups = self.groups.write();
            let state = groups
                .get_mut(&group)
                .ok_or_else(|| BalancerError::GroupNotFound(group.to_string()))?;
            if let Some(shard) = leader {
                if !state.replicas.contains(&shard) {
                    return Err(BalancerError::Rejected(format!(
                        "shard {} holds no replica of group {}",
                        shard, group
                    )));
                }
            }
            state.leader = leader;
        }
        self.notify(LeadershipEvent::GroupLeaderChanged { group, leader });
        Ok(())
    }

    /// Leader counts per shard, for observing convergence
    pub fn leader_counts(&self) -> BTreeMap<Shard, usize> {
        let mut counts = BTreeMap::new();
        for state in self.groups.read().values() {
            for replica in &state.replicas {
                counts.entry(*replica).or_insert(0);
            }
            if let Some(leader) = state.leader {
                *counts.entry(leader).or_insert(0) += 1;
            }
        }
        counts
    }

    // ========================================
    // Controller Leadership
    // ========================================

    /// Gain or lose controller leadership and notify subscribers
    pub fn set_controller_leader(&self, is_leader: bool) {
        let changed = {
            let mut current = self.controller_leader.write();
            let changed = *current != is_leader;
            *current = is_leader;
            changed
        };
        if changed {
            self.notify(LeadershipEvent::ControllerLeadership { is_leader });
        }
    }

    /// Make subsequent barriers fail or succeed
    pub fn set_barrier_ok(&self, ok: bool) {
        *self.barrier_ok.write() = ok;
    }

    fn notify(&self, event: LeadershipEvent) {
        // Ignore if no subscribers
        if self.event_tx.send(event).is_err() {
            debug!("No subscribers for leadership event {:?}", event);
        }
    }
}

#[async_trait]
impl ClusterView for ClusterMetadata {
    fn groups(&self) -> Vec<GroupId> {
        self.groups.read().keys().copied().collect()
    }

    fn replica_shards(&self, group: GroupId) -> Vec<Shard> {
        self.groups
            .read()
            .get(&group)
            .map(|g| g.replicas.clone())
            .unwrap_or_default()
    }

    fn current_leader(&self, group: GroupId) -> Option<Shard> {
        self.groups.read().get(&group).and_then(|g| g.leader)
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }

    fn heartbeat_age(&self, node: NodeId) -> Option<Duration> {
        self.nodes
            .read()
            .get(&node)
            .copied()
            .flatten()
            .map(|at| Instant::now().saturating_duration_since(at))
    }

    fn is_controller_leader(&self) -> bool {
        *self.controller_leader.read()
    }

    async fn linearizable_barrier(&self) -> Result<()> {
        if !self.is_controller_leader() {
            return Err(BalancerError::NotLeader(format!(
                "node {} is not controller leader",
                self.local_node
            )));
        }
        if !*self.barrier_ok.read() {
            return Err(BalancerError::Internal("controller barrier failed".to_string()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.event_tx.subscribe()
    }
}

/// Groups whose replicas include every given shard, led by `leader`
#[cfg(test)]
pub(crate) fn replicated_everywhere(
    metadata: &ClusterMetadata,
    shards: &[Shard],
    groups: impl IntoIterator<Item = (i64, Shard)>,
) {
    for (group, leader) in groups {
        metadata.upsert_group(GroupId(group), shards.to_vec(), Some(leader));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_leader_requires_replica() {
        let metadata = ClusterMetadata::new(NodeId(1));
        let a = Shard::new(1, 0);
        let b = Shard::new(2, 0);
        metadata.upsert_group(GroupId(1), vec![a], Some(a));

        let err = metadata.set_leader(GroupId(1), Some(b)).unwrap_err();
        assert_eq!(err.error_type(), "rejected");
        assert_eq!(metadata.current_leader(GroupId(1)), Some(a));

        let err = metadata.set_leader(GroupId(9), None).unwrap_err();
        assert_eq!(err.error_type(), "group_not_found");
    }

    #[test]
    fn test_leader_counts_include_idle_replicas() {
        let metadata = ClusterMetadata::new(NodeId(1));
        let shards = [Shard::new(1, 0), Shard::new(2, 0), Shard::new(3, 0)];
        replicated_everywhere(&metadata, &shards, [(1, shards[0]), (2, shards[0])]);

        let counts = metadata.leader_counts();
        assert_eq!(counts[&shards[0]], 2);
        assert_eq!(counts[&shards[2]], 0);
        assert_eq!(metadata.nodes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_age() {
        let metadata = ClusterMetadata::new(NodeId(1));
        metadata.register_node(NodeId(2));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(metadata.heartbeat_age(NodeId(2)), Some(Duration::from_secs(5)));
        assert_eq!(metadata.heartbeat_age(NodeId(1)), None);

        metadata.record_heartbeat(NodeId(2));
        assert_eq!(metadata.heartbeat_age(NodeId(2)), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_controller_events() {
        let metadata = ClusterMetadata::new(NodeId(1));
        let mut rx = metadata.subscribe();

        assert!(metadata.linearizable_barrier().await.is_err());
        metadata.set_controller_leader(true);
        metadata.set_controller_leader(true);

        assert_eq!(
            rx.recv().await.unwrap(),
            LeadershipEvent::ControllerLeadership { is_leader: true }
        );
        assert!(rx.try_recv().is_err());
        assert!(metadata.linearizable_barrier().await.is_ok());
    }
}
