//! Balancer error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while balancing leadership
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Not leader: {0}")]
    NotLeader(String),

    #[error("Transfer rejected: {0}")]
    Rejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BalancerError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            BalancerError::Transport(_) => "transport",
            BalancerError::Timeout(_) => "timeout",
            BalancerError::NodeUnavailable(_) => "node_unavailable",
            BalancerError::GroupNotFound(_) => "group_not_found",
            BalancerError::NotLeader(_) => "not_leader",
            BalancerError::Rejected(_) => "rejected",
            BalancerError::Config(_) => "config",
            BalancerError::ShuttingDown => "shutting_down",
            BalancerError::Internal(_) => "internal",
        }
    }
}

impl From<tarpc::client::RpcError> for BalancerError {
    fn from(err: tarpc::client::RpcError) -> Self {
        match err {
            tarpc::client::RpcError::DeadlineExceeded => {
                BalancerError::Timeout("rpc deadline exceeded".to_string())
            }
            other => BalancerError::Transport(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for BalancerError {
    fn from(err: toml::de::Error) -> Self {
        BalancerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BalancerError>;
