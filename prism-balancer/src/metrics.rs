//! Leader balancer observability metrics
//!
//! Provides Prometheus-compatible metrics for:
//! - Balancing ticks and fixpoints
//! - Leadership transfers (outcome, duration, path)
//! - Muted groups and nodes
//! - Transfer RPC duration and errors

use std::time::{Duration, Instant};

/// Record a balancing tick
pub fn record_tick(reason: &str) {
    metrics::counter!(
        "prism_leader_balancer_ticks_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Record a decision that found no improving move
pub fn record_no_improvement() {
    metrics::counter!("prism_leader_balancer_no_improvement_total").increment(1);
}

/// Record a leadership transfer attempt
pub fn record_transfer(path: &str, status: &str, duration: Duration) {
    metrics::counter!(
        "prism_leader_balancer_transfers_total",
        "path" => path.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);

    metrics::histogram!(
        "prism_leader_balancer_transfer_duration_seconds",
        "path" => path.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Update muted entity gauges
pub fn update_muted(groups: usize, nodes: usize) {
    metrics::gauge!("prism_leader_balancer_muted_groups").set(groups as f64);
    metrics::gauge!("prism_leader_balancer_muted_nodes").set(nodes as f64);
}

/// Update the leadership imbalance gauge
pub fn update_imbalance(spread: usize) {
    metrics::gauge!("prism_leader_balancer_imbalance").set(spread as f64);
}

/// Record RPC call duration
pub fn record_rpc_duration(method: &str, target_node: &str, duration: Duration) {
    metrics::histogram!(
        "prism_leader_balancer_rpc_duration_seconds",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record RPC call success
pub fn record_rpc_success(method: &str, target_node: &str) {
    metrics::counter!(
        "prism_leader_balancer_rpc_requests_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "ok",
    )
    .increment(1);
}

/// Record RPC call error
pub fn record_rpc_error(method: &str, target_node: &str, error_type: &str) {
    metrics::counter!(
        "prism_leader_balancer_rpc_requests_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "prism_leader_balancer_rpc_errors_total",
        "method" => method.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record server-side RPC handler outcome
pub fn record_rpc_handler(method: &str, status: &str, duration: Duration) {
    metrics::counter!(
        "prism_leader_balancer_rpc_handler_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);

    metrics::histogram!(
        "prism_leader_balancer_rpc_handler_duration_seconds",
        "method" => method.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Timer for client-side RPC calls
pub struct RpcTimer {
    method: &'static str,
    target: String,
    start: Instant,
}

impl RpcTimer {
    pub fn new(method: &'static str, target: impl ToString) -> Self {
        Self {
            method,
            target: target.to_string(),
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        record_rpc_duration(self.method, &self.target, self.start.elapsed());
        record_rpc_success(self.method, &self.target);
    }

    pub fn error(self, error_type: &str) {
        record_rpc_duration(self.method, &self.target, self.start.elapsed());
        record_rpc_error(self.method, &self.target, error_type);
    }
}

/// Timer for server-side RPC handlers
pub struct RpcHandlerTimer {
    method: &'static str,
    start: Instant,
}

impl RpcHandlerTimer {
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        record_rpc_handler(self.method, "ok", self.start.elapsed());
    }

    pub fn error(self, error_type: &str) {
        record_rpc_handler(self.method, error_type, self.start.elapsed());
    }
}
