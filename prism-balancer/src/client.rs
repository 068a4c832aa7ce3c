//! Leadership transfer RPC client
//!
//! Keeps one tarpc client per peer node. Establishing the underlying
//! connections belongs to the host's transport layer, which registers each
//! client here once it is connected.

use crate::error::{BalancerError, Result};
use crate::metrics::RpcTimer;
use crate::service::LeaderBalancerRpcClient;
use crate::transfer::RemoteLeadership;
use crate::types::{NodeId, TransferLeadershipRequest};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tarpc::context;
use tracing::{debug, info};

/// Peer table of leadership transfer clients
#[derive(Clone, Default)]
pub struct BalancerClient {
    peers: Arc<RwLock<HashMap<NodeId, LeaderBalancerRpcClient>>>,
}

impl BalancerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client used to reach `node`
    pub fn register_peer(&self, node: NodeId, client: LeaderBalancerRpcClient) {
        info!("Registered leadership transfer client for node {}", node);
        self.peers.write().insert(node, client);
    }

    /// Remove a peer, e.g. after its connection dropped
    pub fn remove_peer(&self, node: NodeId) -> bool {
        self.peers.write().remove(&node).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn get_client(&self, node: NodeId) -> Result<LeaderBalancerRpcClient> {
        self.peers
            .read()
            .get(&node)
            .cloned()
            .ok_or_else(|| BalancerError::NodeUnavailable(format!("no client for node {}", node)))
    }

    /// Create a context whose deadline is `timeout` from now
    fn context(timeout: Duration) -> context::Context {
        let mut ctx = context::current();
        ctx.deadline = std::time::Instant::now() + timeout;
        ctx
    }

    /// Ping a peer
    pub async fn ping(&self, node: NodeId, timeout: Duration) -> Result<String> {
        let timer = RpcTimer::new("ping", node);
        let client = self.get_client(node)?;
        match client.ping(Self::context(timeout)).await {
            Ok(reply) => {
                timer.success();
                Ok(reply)
            }
            Err(e) => {
                let err = BalancerError::from(e);
                timer.error(err.error_type());
                Err(err)
            }
        }
    }
}

#[async_trait]
impl RemoteLeadership for BalancerClient {
    async fn transfer_leadership(
        &self,
        node: NodeId,
        request: TransferLeadershipRequest,
        timeout: Duration,
    ) -> Result<()> {
        let timer = RpcTimer::new("transfer_leadership", node);
        let client = match self.get_client(node) {
            Ok(client) => client,
            Err(e) => {
                timer.error(e.error_type());
                return Err(e);
            }
        };

        debug!(
            "Requesting node {} to lead group {} on {}",
            node, request.group, request.target
        );
        let group = request.group;
        let result = match client
            .transfer_leadership(Self::context(timeout), request)
            .await
            .map_err(BalancerError::from)
        {
            Ok(Ok(response)) if response.success => Ok(()),
            Ok(Ok(_)) => Err(BalancerError::Rejected(format!(
                "node {} declined leadership of group {}",
                node, group
            ))),
            Ok(Err(e)) | Err(e) => Err(e),
        };

        match &result {
            Ok(()) => timer.success(),
            Err(e) => timer.error(e.error_type()),
        }
        result
    }
}
