//! Read-only view of cluster metadata consumed by the balancer
//!
//! The balancer never writes cluster metadata. It reads group placement and
//! leadership, node liveness and controller leadership through
//! [`ClusterView`], and subscribes to leadership notifications to wake up.

mod state;

pub use state::ClusterMetadata;

use crate::error::Result;
use crate::types::{GroupId, LeadershipEvent, NodeId, Shard};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capabilities the balancer needs from the metadata and replication layers.
///
/// All reads are synchronous against in-memory state and must not block.
#[async_trait]
pub trait ClusterView: Send + Sync + 'static {
    /// Every group this process knows about
    fn groups(&self) -> Vec<GroupId>;

    /// Shards holding a replica of `group`
    fn replica_shards(&self, group: GroupId) -> Vec<Shard>;

    /// Current leader of `group`, if one is known
    fn current_leader(&self, group: GroupId) -> Option<Shard>;

    /// Every node that is a member of the cluster
    fn nodes(&self) -> Vec<NodeId>;

    /// Time since the last controller heartbeat from `node`.
    ///
    /// `None` when no liveness information exists (including this node).
    fn heartbeat_age(&self, node: NodeId) -> Option<Duration>;

    /// Whether this process currently holds overall cluster leadership
    fn is_controller_leader(&self) -> bool;

    /// Make sure controller state reflects everything committed before this
    /// node became controller leader.
    async fn linearizable_barrier(&self) -> Result<()>;

    /// Register for leadership change notifications
    fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent>;
}
