//! Prism Balancer - Leadership rebalancing for replicated groups
//!
//! Runs on the controller leader and keeps group leadership evenly spread
//! across shards by moving it one group at a time.
//!
//! # Architecture
//!
//! - **Balancer**: Control loop driven by timers and leadership notifications
//! - **Cluster**: Read-only view of placement, leadership and node liveness
//! - **Index**: Per-decision snapshot of replicas and leaders
//! - **Mute**: Time-bounded exclusion of recently moved groups and of nodes
//! - **Strategy**: Pluggable computation of the next leadership move
//! - **Transfer**: Local or RPC leadership transfer with timeout
//! - **Service/Server/Client**: tarpc surface for remote transfers
//!
//! # Key Operations
//!
//! - Balancer lifecycle: start, stop, trigger, status
//! - Decision: build index, compute reassignment, attempt transfer
//! - Configuration: live enable/disable and timeout updates

pub mod balancer;
pub mod cluster;
pub mod config;
pub mod error;
pub mod index;
pub mod metrics;
pub mod mute;
pub mod service;
pub mod strategy;
pub mod transfer;
pub mod types;

mod client;
mod server;

pub use balancer::{
    BalancerPhase, BalancerStatus, LeaderBalancer, TickReason, MAX_ITERATIONS_PER_TICK,
};
pub use client::BalancerClient;
pub use cluster::{ClusterMetadata, ClusterView};
pub use config::{binding, BalancerConfig, ConfigHandle, ConfigWatch, StrategyKind};
pub use error::{BalancerError, Result};
pub use index::{build_index, AssignmentIndex, GroupAssignment, LastLeaderCache};
pub use mute::MuteTracker;
pub use server::BalancerServer;
pub use service::{LeaderBalancerRpc, LeaderBalancerRpcClient};
pub use strategy::{BalancingStrategy, GreedyBalancedNodes, GreedyBalancedShards};
pub use transfer::{
    LocalLeadership, RemoteLeadership, TransferExecutor, TransferOutcome, TransferPath,
};
pub use types::*;
