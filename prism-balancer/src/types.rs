//! Core identifiers and wire types for leadership balancing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a cluster node (broker)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub i32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a replicated group (one consensus group per partition)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An addressable execution unit: a shard (core) on a specific node.
///
/// Ordering is by node first, then shard, which gives every strategy a
/// stable tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Shard {
    /// Node hosting the shard
    pub node_id: NodeId,

    /// Shard index within the node
    pub shard: u32,
}

impl Shard {
    /// Create a new shard address
    pub fn new(node_id: i32, shard: u32) -> Self {
        Self {
            node_id: NodeId(node_id),
            shard,
        }
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{node: {}, shard: {}}}", self.node_id, self.shard)
    }
}

/// A proposed leadership move for a single group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassignment {
    /// Group whose leadership moves
    pub group: GroupId,

    /// Current leader shard
    pub from: Shard,

    /// Candidate new leader shard
    pub to: Shard,
}

impl fmt::Display for Reassignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {} from {} to {}", self.group, self.from, self.to)
    }
}

/// Notification published by the cluster metadata layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// This node gained or lost overall cluster (controller) leadership
    ControllerLeadership { is_leader: bool },

    /// Leadership of a group changed; `leader` is `None` while an election runs
    GroupLeaderChanged {
        group: GroupId,
        leader: Option<Shard>,
    },
}

// ========================================
// RPC types
// ========================================

/// Request asking a node to take leadership of a group on one of its shards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeadershipRequest {
    /// Group to transfer
    pub group: GroupId,

    /// Shard that should become leader
    pub target: Shard,
}

impl From<Reassignment> for TransferLeadershipRequest {
    fn from(reassignment: Reassignment) -> Self {
        Self {
            group: reassignment.group,
            target: reassignment.to,
        }
    }
}

/// Response to a leadership transfer request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeadershipResponse {
    /// Whether the replication layer accepted the transfer
    pub success: bool,
}
