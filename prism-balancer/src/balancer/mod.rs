//! Leadership balancing control loop
//!
//! ```text
//! Inactive --(controller leadership gained)--> Activating
//! Activating --(activation delay elapsed)--> Balancing
//! Balancing --(fixpoint)--> Idle
//! Idle --(idle timeout | leadership change | trigger)--> Balancing
//! any --(controller leadership lost)--> Inactive
//! any --(stop)--> Stopped
//! ```

mod engine;

pub use engine::{LeaderBalancer, MAX_ITERATIONS_PER_TICK};

use crate::types::Reassignment;
use serde::{Deserialize, Serialize};

/// Phase of the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerPhase {
    /// Not the controller leader; nothing scheduled
    Inactive,
    /// Waiting out the activation delay after gaining controller leadership
    Activating,
    /// Waiting for the idle timeout or a wake-up
    Idle,
    /// Running balancing iterations
    Balancing,
    /// Shut down
    Stopped,
}

/// Why a tick started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickReason {
    /// Activation delay elapsed
    Activation,
    /// Low frequency safety-net timer
    IdleTimeout,
    /// A group's leadership changed
    LeadershipChange,
    /// Requested through [`LeaderBalancer::trigger`]
    Manual,
}

impl TickReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickReason::Activation => "activation",
            TickReason::IdleTimeout => "idle_timeout",
            TickReason::LeadershipChange => "leadership_change",
            TickReason::Manual => "manual",
        }
    }
}

/// Snapshot of balancer state for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerStatus {
    /// Current phase
    pub phase: BalancerPhase,

    /// Whether balancing is switched on
    pub enabled: bool,

    /// Ticks run since start
    pub ticks: u64,

    /// Successful leadership transfers
    pub transfers_succeeded: u64,

    /// Failed or timed out leadership transfers
    pub transfers_failed: u64,

    /// Decisions that found the cluster at a fixpoint
    pub no_improvement: u64,

    /// Groups muted at the last decision
    pub muted_groups: usize,

    /// Nodes muted at the last decision
    pub muted_nodes: usize,

    /// Most recent move attempted
    pub last_reassignment: Option<Reassignment>,

    /// Last error message if any
    pub last_error: Option<String>,
}

impl Default for BalancerStatus {
    fn default() -> Self {
        Self {
            phase: BalancerPhase::Inactive,
            enabled: true,
            ticks: 0,
            transfers_succeeded: 0,
            transfers_failed: 0,
            no_improvement: 0,
            muted_groups: 0,
            muted_nodes: 0,
            last_reassignment: None,
            last_error: None,
        }
    }
}
