//! Leadership transfer RPC server
//!
//! Serves [`LeaderBalancerRpc`] by handing each request to this node's
//! replication layer, so a remote transfer ends in the same local transfer
//! the controller leader would have made had the shard been its own.

use crate::error::BalancerError;
use crate::metrics::RpcHandlerTimer;
use crate::service::{
    LeaderBalancerRpc, LeaderBalancerRpcClient, LeaderBalancerRpcRequest, LeaderBalancerRpcResponse,
};
use crate::transfer::LocalLeadership;
use crate::types::{NodeId, TransferLeadershipRequest, TransferLeadershipResponse};
use futures::StreamExt;
use std::sync::Arc;
use tarpc::context::Context;
use tarpc::server::{BaseChannel, Channel};
use tarpc::{ClientMessage, Response, Transport};
use tracing::{debug, info, warn};

/// Server side of the leadership transfer RPC for one node
#[derive(Clone)]
pub struct BalancerServer {
    local_node: NodeId,
    local: Arc<dyn LocalLeadership>,
}

impl BalancerServer {
    /// Create a server that transfers leadership through `local`
    pub fn new(local_node: NodeId, local: Arc<dyn LocalLeadership>) -> Self {
        Self { local_node, local }
    }

    /// Serve every request arriving on `transport` until it closes
    pub async fn serve_channel<T>(&self, transport: T)
    where
        T: Transport<Response<LeaderBalancerRpcResponse>, ClientMessage<LeaderBalancerRpcRequest>>
            + Send
            + 'static,
    {
        let handler = BalancerHandler {
            server: self.clone(),
        };

        BaseChannel::with_defaults(transport)
            .execute(handler.serve())
            .for_each(|response| async move {
                tokio::spawn(response);
            })
            .await;

        debug!("Leadership transfer channel closed on node {}", self.local_node);
    }

    /// Connect to this server through an in-process channel.
    ///
    /// Used when balancer and replication layer share a process but the
    /// caller still wants to go through the RPC surface.
    pub fn connect_in_process(&self) -> LeaderBalancerRpcClient {
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();
        let server = self.clone();
        tokio::spawn(async move {
            server.serve_channel(server_transport).await;
        });
        LeaderBalancerRpcClient::new(tarpc::client::Config::default(), client_transport).spawn()
    }
}

/// Handler that implements the LeaderBalancerRpc service
#[derive(Clone)]
struct BalancerHandler {
    server: BalancerServer,
}

impl LeaderBalancerRpc for BalancerHandler {
    async fn transfer_leadership(
        self,
        _ctx: Context,
        request: TransferLeadershipRequest,
    ) -> Result<TransferLeadershipResponse, BalancerError> {
        let timer = RpcHandlerTimer::new("transfer_leadership");

        if request.target.node_id != self.server.local_node {
            let err = BalancerError::Rejected(format!(
                "target {} is not on node {}",
                request.target, self.server.local_node
            ));
            warn!("Rejecting leadership transfer of group {}: {}", request.group, err);
            timer.error(err.error_type());
            return Err(err);
        }

        match self
            .server
            .local
            .transfer_leadership(request.group, request.target)
            .await
        {
            Ok(()) => {
                info!(
                    "Took leadership of group {} on {}",
                    request.group, request.target
                );
                timer.success();
                Ok(TransferLeadershipResponse { success: true })
            }
            Err(e) => {
                debug!("Leadership transfer of group {} failed: {}", request.group, e);
                timer.error(e.error_type());
                Err(e)
            }
        }
    }

    async fn ping(self, _ctx: Context) -> String {
        let timer = RpcHandlerTimer::new("ping");
        timer.success();
        format!("pong from node {}", self.server.local_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BalancerClient;
    use crate::transfer::tests::Recorder;
    use crate::transfer::RemoteLeadership;
    use crate::types::{GroupId, Shard};
    use std::time::Duration;

    #[tokio::test]
    async fn test_remote_transfer_over_channel() {
        let recorder = Arc::new(Recorder::default());
        let server = BalancerServer::new(NodeId(2), recorder.clone());
        let client = BalancerClient::new();
        client.register_peer(NodeId(2), server.connect_in_process());
        assert_eq!(client.peer_count(), 1);

        let request = TransferLeadershipRequest {
            group: GroupId(4),
            target: Shard::new(2, 1),
        };
        client
            .transfer_leadership(NodeId(2), request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            recorder.calls.lock()[0],
            (None, GroupId(4), Shard::new(2, 1))
        );
        assert_eq!(
            client.ping(NodeId(2), Duration::from_secs(5)).await.unwrap(),
            "pong from node 2"
        );
    }

    #[tokio::test]
    async fn test_wrong_node_rejected() {
        let recorder = Arc::new(Recorder::default());
        let server = BalancerServer::new(NodeId(2), recorder.clone());
        let client = BalancerClient::new();
        client.register_peer(NodeId(3), server.connect_in_process());

        let request = TransferLeadershipRequest {
            group: GroupId(4),
            target: Shard::new(3, 0),
        };
        let err = client
            .transfer_leadership(NodeId(3), request, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.error_type(), "rejected");
        assert!(recorder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_local_failure_propagates() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let server = BalancerServer::new(NodeId(2), recorder);
        let client = BalancerClient::new();
        client.register_peer(NodeId(2), server.connect_in_process());

        let request = TransferLeadershipRequest {
            group: GroupId(4),
            target: Shard::new(2, 0),
        };
        let err = client
            .transfer_leadership(NodeId(2), request, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, BalancerError::Rejected("no".into()));
    }

    #[tokio::test]
    async fn test_unknown_peer_unavailable() {
        let client = BalancerClient::new();
        let request = TransferLeadershipRequest {
            group: GroupId(1),
            target: Shard::new(9, 0),
        };
        let err = client
            .transfer_leadership(NodeId(9), request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "node_unavailable");
        assert!(!client.remove_peer(NodeId(9)));
        assert_eq!(client.peer_count(), 0);
    }
}
