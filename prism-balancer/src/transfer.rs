//! Leadership transfer execution
//!
//! A move whose destination shard lives on this node goes straight to the
//! local replication layer. Any other move is sent to the destination node,
//! which performs the same local transfer on its side. Either way the group
//! is muted once the attempt finishes.

use crate::error::{BalancerError, Result};
use crate::metrics;
use crate::mute::MuteTracker;
use crate::types::{GroupId, NodeId, Reassignment, Shard, TransferLeadershipRequest};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Leadership transfer performed by the replication layer in this process
#[async_trait]
pub trait LocalLeadership: Send + Sync + 'static {
    /// Make `target` (a shard on this node) the leader of `group`
    async fn transfer_leadership(&self, group: GroupId, target: Shard) -> Result<()>;
}

/// Leadership transfer requested from another node
#[async_trait]
pub trait RemoteLeadership: Send + Sync + 'static {
    /// Ask `node` to take leadership as described by `request`
    async fn transfer_leadership(
        &self,
        node: NodeId,
        request: TransferLeadershipRequest,
        timeout: Duration,
    ) -> Result<()>;
}

/// Which side carried out a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    Local,
    Remote,
}

impl TransferPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPath::Local => "local",
            TransferPath::Remote => "remote",
        }
    }
}

/// Result of a single transfer attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub path: TransferPath,
    pub result: Result<()>,
    pub elapsed: Duration,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Executes reassignments chosen by the strategy
pub struct TransferExecutor {
    local_node: NodeId,
    local: Arc<dyn LocalLeadership>,
    remote: Arc<dyn RemoteLeadership>,
}

impl TransferExecutor {
    /// Create an executor for `local_node`
    pub fn new(
        local_node: NodeId,
        local: Arc<dyn LocalLeadership>,
        remote: Arc<dyn RemoteLeadership>,
    ) -> Self {
        Self {
            local_node,
            local,
            remote,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Attempt `reassignment` and mute its group until at least
    /// `mute_timeout` past completion, whatever the outcome.
    ///
    /// Remote attempts are bounded by `transfer_timeout`; a timeout is a
    /// failure like any other.
    pub async fn attempt_transfer(
        &self,
        reassignment: Reassignment,
        transfer_timeout: Duration,
        mute_timeout: Duration,
        mutes: &mut MuteTracker,
    ) -> TransferOutcome {
        let start = Instant::now();
        let (path, result) = if reassignment.to.node_id == self.local_node {
            (TransferPath::Local, self.transfer_local(reassignment).await)
        } else {
            (
                TransferPath::Remote,
                self.transfer_remote(reassignment, transfer_timeout).await,
            )
        };
        let elapsed = start.elapsed();

        mutes.mute_group(reassignment.group, Instant::now() + mute_timeout);

        match &result {
            Ok(()) => {
                info!(
                    "Transferred leadership of {} ({} in {:?})",
                    reassignment,
                    path.as_str(),
                    elapsed
                );
                metrics::record_transfer(path.as_str(), "succeeded", elapsed);
            }
            Err(BalancerError::Timeout(msg)) => {
                warn!(
                    "Leadership transfer of {} timed out after {:?}: {}",
                    reassignment, elapsed, msg
                );
                metrics::record_transfer(path.as_str(), "timeout", elapsed);
            }
            Err(e) => {
                info!("Error transferring leadership of {}: {}", reassignment, e);
                metrics::record_transfer(path.as_str(), "failed", elapsed);
            }
        }

        TransferOutcome {
            path,
            result,
            elapsed,
        }
    }

    async fn transfer_local(&self, reassignment: Reassignment) -> Result<()> {
        debug!("Local leadership transfer of {}", reassignment);
        self.local
            .transfer_leadership(reassignment.group, reassignment.to)
            .await
    }

    async fn transfer_remote(&self, reassignment: Reassignment, timeout: Duration) -> Result<()> {
        let node = reassignment.to.node_id;
        debug!(
            "Remote leadership transfer of {} via node {}",
            reassignment, node
        );
        let call = self
            .remote
            .transfer_leadership(node, reassignment.into(), timeout);
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BalancerError::Timeout(format!(
                "transfer of group {} to node {} exceeded {:?}",
                reassignment.group, node, timeout
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records calls and answers with a fixed result
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub calls: Mutex<Vec<(Option<NodeId>, GroupId, Shard)>>,
        pub fail: bool,
        pub hang: bool,
    }

    #[async_trait]
    impl LocalLeadership for Recorder {
        async fn transfer_leadership(&self, group: GroupId, target: Shard) -> Result<()> {
            self.calls.lock().push((None, group, target));
            if self.fail {
                return Err(BalancerError::Rejected("no".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteLeadership for Recorder {
        async fn transfer_leadership(
            &self,
            node: NodeId,
            request: TransferLeadershipRequest,
            _timeout: Duration,
        ) -> Result<()> {
            self.calls
                .lock()
                .push((Some(node), request.group, request.target));
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(BalancerError::Transport("connection reset".into()));
            }
            Ok(())
        }
    }

    fn reassignment(to_node: i32) -> Reassignment {
        Reassignment {
            group: GroupId(7),
            from: Shard::new(2, 0),
            to: Shard::new(to_node, 1),
        }
    }

    #[tokio::test]
    async fn test_local_destination_stays_local() {
        let local = Arc::new(Recorder::default());
        let remote = Arc::new(Recorder::default());
        let executor = TransferExecutor::new(NodeId(1), local.clone(), remote.clone());
        let mut mutes = MuteTracker::new();

        let outcome = executor
            .attempt_transfer(
                reassignment(1),
                Duration::from_secs(1),
                Duration::from_secs(60),
                &mut mutes,
            )
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.path, TransferPath::Local);
        assert_eq!(local.calls.lock().len(), 1);
        assert!(remote.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remote_destination_uses_rpc() {
        let local = Arc::new(Recorder::default());
        let remote = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let executor = TransferExecutor::new(NodeId(1), local.clone(), remote.clone());
        let mut mutes = MuteTracker::new();

        let outcome = executor
            .attempt_transfer(
                reassignment(3),
                Duration::from_secs(1),
                Duration::from_secs(60),
                &mut mutes,
            )
            .await;

        assert_eq!(outcome.path, TransferPath::Remote);
        assert_eq!(outcome.result.unwrap_err().error_type(), "transport");
        assert_eq!(
            remote.calls.lock()[0],
            (Some(NodeId(3)), GroupId(7), Shard::new(3, 1))
        );
        assert!(local.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_always_mutes() {
        let mute_timeout = Duration::from_secs(60);
        for fail in [false, true] {
            let recorder = Arc::new(Recorder {
                fail,
                ..Default::default()
            });
            let executor = TransferExecutor::new(NodeId(1), recorder.clone(), recorder.clone());
            let mut mutes = MuteTracker::new();

            executor
                .attempt_transfer(reassignment(1), Duration::from_secs(1), mute_timeout, &mut mutes)
                .await;
            let returned_at = Instant::now();

            assert!(mutes.muted_groups(returned_at).contains(&GroupId(7)));
            assert!(mutes.group_expiry(GroupId(7)).unwrap() >= returned_at + mute_timeout);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_timeout_is_failure() {
        let recorder = Arc::new(Recorder {
            hang: true,
            ..Default::default()
        });
        let executor = TransferExecutor::new(NodeId(1), recorder.clone(), recorder.clone());
        let mut mutes = MuteTracker::new();
        let start = Instant::now();

        let outcome = executor
            .attempt_transfer(
                reassignment(2),
                Duration::from_secs(30),
                Duration::from_secs(60),
                &mut mutes,
            )
            .await;

        assert_eq!(outcome.result.unwrap_err().error_type(), "timeout");
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert!(mutes.is_group_muted(GroupId(7), Instant::now()));
    }
}
