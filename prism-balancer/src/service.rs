//! tarpc service definition for leadership transfer RPC

use crate::error::BalancerError;
use crate::types::{TransferLeadershipRequest, TransferLeadershipResponse};

/// RPC served by every node so the balancer on the controller leader can
/// move leadership onto that node's shards.
#[tarpc::service]
pub trait LeaderBalancerRpc {
    /// Take leadership of a group on one of this node's shards
    async fn transfer_leadership(
        request: TransferLeadershipRequest,
    ) -> Result<TransferLeadershipResponse, BalancerError>;

    /// Simple ping for health checking
    async fn ping() -> String;
}
