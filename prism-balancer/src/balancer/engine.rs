//! Leader balancer engine
//!
//! One task owns all balancing state (mutes, last-known leaders, timer) and
//! makes every decision, so moves within a tick are applied strictly one at
//! a time, each against a freshly built index.

use super::{BalancerPhase, BalancerStatus, TickReason};
use crate::cluster::ClusterView;
use crate::config::ConfigWatch;
use crate::error::{BalancerError, Result};
use crate::index::{build_index, LastLeaderCache};
use crate::metrics;
use crate::mute::MuteTracker;
use crate::strategy::BalancingStrategy;
use crate::transfer::TransferExecutor;
use crate::types::{LeadershipEvent, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Upper bound on moves made by a single tick
pub const MAX_ITERATIONS_PER_TICK: usize = 1024;

/// Whether a tick should keep iterating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

/// Requests from the handle to the loop task
#[derive(Debug, Clone, Copy)]
enum Command {
    Tick(TickReason),
    MuteNode(NodeId, Duration),
}

/// What woke the loop up
enum Wake {
    Shutdown,
    Timer(TickReason),
    Command(Command),
    CommandsClosed,
    Event(std::result::Result<LeadershipEvent, RecvError>),
    ConfigChanged,
}

/// Handle to the leadership balancing control loop
pub struct LeaderBalancer {
    status: Arc<RwLock<BalancerStatus>>,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    pending: Mutex<Option<BalancerLoop>>,
}

impl LeaderBalancer {
    /// Create a balancer; nothing runs until [`start`](Self::start)
    pub fn new(
        view: Arc<dyn ClusterView>,
        executor: TransferExecutor,
        config: ConfigWatch,
    ) -> Self {
        let status = Arc::new(RwLock::new(BalancerStatus {
            enabled: config.enabled(),
            ..Default::default()
        }));
        let (commands, command_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let strategy = config.current().strategy.build();

        let balancer_loop = BalancerLoop::new(
            view,
            executor,
            strategy,
            config,
            Arc::clone(&status),
            shutdown.clone(),
            command_rx,
        );

        Self {
            status,
            commands,
            shutdown,
            tasks: TaskTracker::new(),
            pending: Mutex::new(Some(balancer_loop)),
        }
    }

    /// Replace the strategy chosen from configuration
    pub fn with_strategy(mut self, strategy: Box<dyn BalancingStrategy>) -> Self {
        if let Some(balancer_loop) = self.pending.get_mut().as_mut() {
            balancer_loop.strategy = strategy;
        }
        self
    }

    /// Spawn the control loop
    pub fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BalancerError::ShuttingDown);
        }
        let balancer_loop = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| BalancerError::Internal("leader balancer already started".to_string()))?;

        self.tasks.spawn(balancer_loop.run());
        Ok(())
    }

    /// Stop the control loop and wait for it to finish.
    ///
    /// A pending wait is interrupted; an in-flight transfer is abandoned.
    pub async fn stop(&self) {
        info!("Stopping leader balancer");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.pending.lock().take();
        self.status.write().phase = BalancerPhase::Stopped;
    }

    /// Request an immediate tick. Returns false if the request could not be
    /// queued. The loop ignores it unless idle.
    pub fn trigger(&self) -> bool {
        self.commands
            .try_send(Command::Tick(TickReason::Manual))
            .is_ok()
    }

    /// Exclude every shard of `node` from balancing for `duration`
    pub async fn mute_node(&self, node: NodeId, duration: Duration) -> Result<()> {
        self.commands
            .send(Command::MuteNode(node, duration))
            .await
            .map_err(|_| BalancerError::ShuttingDown)
    }

    /// Current status snapshot
    pub fn status(&self) -> BalancerStatus {
        self.status.read().clone()
    }

    /// Whether the loop task is running
    pub fn is_running(&self) -> bool {
        self.pending.lock().is_none() && !self.shutdown.is_cancelled()
    }
}

/// State owned by the control loop task
struct BalancerLoop {
    view: Arc<dyn ClusterView>,
    executor: TransferExecutor,
    strategy: Box<dyn BalancingStrategy>,
    config: ConfigWatch,
    mutes: MuteTracker,
    last_leaders: LastLeaderCache,
    status: Arc<RwLock<BalancerStatus>>,
    shutdown: CancellationToken,
    command_rx: mpsc::Receiver<Command>,
    timer: Option<(Instant, TickReason)>,
    need_barrier: bool,
    enabled: bool,
}

impl BalancerLoop {
    fn new(
        view: Arc<dyn ClusterView>,
        executor: TransferExecutor,
        strategy: Box<dyn BalancingStrategy>,
        config: ConfigWatch,
        status: Arc<RwLock<BalancerStatus>>,
        shutdown: CancellationToken,
        command_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let enabled = config.enabled();
        Self {
            view,
            executor,
            strategy,
            config,
            mutes: MuteTracker::new(),
            last_leaders: LastLeaderCache::new(),
            status,
            shutdown,
            command_rx,
            timer: None,
            need_barrier: true,
            enabled,
        }
    }

    fn phase(&self) -> BalancerPhase {
        self.status.read().phase
    }

    fn set_phase(&self, phase: BalancerPhase) {
        self.status.write().phase = phase;
    }

    async fn run(mut self) {
        let mut events = self.view.subscribe();
        let mut events_open = true;
        let mut commands_open = true;
        let shutdown = self.shutdown.clone();

        info!(
            "Leader balancer started on node {}, strategy={}",
            self.executor.local_node(),
            self.strategy.name()
        );

        if self.view.is_controller_leader() {
            self.on_controller_leadership(true);
        }

        loop {
            let timer = self.timer;
            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Wake::Shutdown,
                _ = sleep_until(timer.map(|(at, _)| at)) => {
                    Wake::Timer(timer.map_or(TickReason::IdleTimeout, |(_, reason)| reason))
                }
                command = self.command_rx.recv(), if commands_open => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::CommandsClosed,
                },
                event = events.recv(), if events_open => Wake::Event(event),
                _ = self.config.changed() => Wake::ConfigChanged,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Timer(reason) => {
                    self.timer = None;
                    self.tick(reason).await;
                    events_open = self.drain_events(&mut events);
                }
                Wake::Command(Command::Tick(reason)) => {
                    if self.wake_up(reason).await {
                        events_open = self.drain_events(&mut events);
                    }
                }
                Wake::Command(Command::MuteNode(node, duration)) => {
                    info!("Leadership balancer muting node {} for {:?}", node, duration);
                    self.mutes.mute_node(node, Instant::now() + duration);
                }
                Wake::CommandsClosed => commands_open = false,
                Wake::Event(Ok(LeadershipEvent::ControllerLeadership { is_leader })) => {
                    self.on_controller_leadership(is_leader);
                }
                Wake::Event(Ok(LeadershipEvent::GroupLeaderChanged { .. })) => {
                    if self.wake_up(TickReason::LeadershipChange).await {
                        events_open = self.drain_events(&mut events);
                    }
                }
                Wake::Event(Err(RecvError::Lagged(skipped))) => {
                    debug!("Missed {} leadership notifications", skipped);
                    self.need_barrier = true;
                    if self.wake_up(TickReason::LeadershipChange).await {
                        events_open = self.drain_events(&mut events);
                    }
                }
                Wake::Event(Err(RecvError::Closed)) => {
                    warn!("Leadership notifications closed; relying on idle timeout");
                    events_open = false;
                }
                Wake::ConfigChanged => self.on_config_changed(),
            }
        }

        self.set_phase(BalancerPhase::Stopped);
        info!("Leader balancer stopped");
    }

    /// Fold notifications that arrived during a tick into it, keeping
    /// controller leadership changes. Returns whether the channel is open.
    fn drain_events(&mut self, events: &mut broadcast::Receiver<LeadershipEvent>) -> bool {
        loop {
            match events.try_recv() {
                Ok(LeadershipEvent::ControllerLeadership { is_leader }) => {
                    self.on_controller_leadership(is_leader);
                }
                Ok(LeadershipEvent::GroupLeaderChanged { .. }) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    // A lost controller leadership change may hide a new term
                    debug!("Missed {} leadership notifications during tick", skipped);
                    self.need_barrier = true;
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Closed) => return false,
            }
        }
    }

    /// Run a tick now if the loop is idle
    async fn wake_up(&mut self, reason: TickReason) -> bool {
        if self.phase() != BalancerPhase::Idle {
            trace!("Ignoring {} wake-up while {:?}", reason.as_str(), self.phase());
            return false;
        }
        self.timer = None;
        self.tick(reason).await;
        true
    }

    fn on_controller_leadership(&mut self, is_leader: bool) {
        if is_leader {
            if self.phase() != BalancerPhase::Inactive {
                return;
            }
            let delay = self.config.current().activation_delay();
            info!(
                "Controller leadership gained, leader balancing starts in {:?}",
                delay
            );
            self.need_barrier = true;
            self.timer = Some((Instant::now() + delay, TickReason::Activation));
            self.set_phase(BalancerPhase::Activating);
        } else {
            if self.phase() == BalancerPhase::Inactive {
                return;
            }
            info!("Controller leadership lost, leader balancer going inactive");
            self.go_inactive();
        }
    }

    fn go_inactive(&mut self) {
        self.timer = None;
        self.need_barrier = true;
        self.set_phase(BalancerPhase::Inactive);
    }

    fn on_config_changed(&mut self) {
        let enabled = self.config.enabled();
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        self.status.write().enabled = enabled;

        if !enabled {
            info!("Leader balancer disabled");
            return;
        }

        info!("Leader balancer enabled");
        if matches!(self.phase(), BalancerPhase::Idle | BalancerPhase::Activating) {
            let delay = self.config.current().activation_delay();
            self.timer = Some((Instant::now() + delay, TickReason::Activation));
            self.set_phase(BalancerPhase::Activating);
        }
    }

    /// Balance until the strategy reaches a fixpoint, then go idle
    async fn tick(&mut self, reason: TickReason) {
        debug!("Leadership balancer tick ({})", reason.as_str());
        metrics::record_tick(reason.as_str());
        {
            let mut status = self.status.write();
            status.ticks += 1;
            status.phase = BalancerPhase::Balancing;
        }

        let mut iterations = 0;
        while !self.shutdown.is_cancelled() {
            match self.balance().await {
                Step::Stop => break,
                Step::Continue => {
                    iterations += 1;
                    if iterations >= MAX_ITERATIONS_PER_TICK {
                        info!(
                            "Leadership balancer tick stopped after {} moves",
                            iterations
                        );
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }

        if self.shutdown.is_cancelled() {
            return;
        }

        if self.view.is_controller_leader() {
            let idle = self.config.current().idle_timeout();
            self.timer = Some((Instant::now() + idle, TickReason::IdleTimeout));
            self.set_phase(BalancerPhase::Idle);
        } else {
            self.go_inactive();
        }
    }

    /// One decision: pick at most one move and carry it out
    async fn balance(&mut self) -> Step {
        let config = self.config.current();
        if !config.enabled {
            trace!("Leadership balancer tick: disabled");
            return Step::Stop;
        }

        if !self.view.is_controller_leader() {
            debug!("Leadership balancer tick: not controller leader");
            self.need_barrier = true;
            return Step::Stop;
        }

        if self.view.nodes().len() <= 1 {
            trace!("Leadership balancer tick: single node cluster");
            return Step::Stop;
        }

        if self.need_barrier {
            if let Err(e) = self.view.linearizable_barrier().await {
                debug!("Leadership balancer tick: controller barrier failed: {}", e);
                self.status.write().last_error = Some(e.to_string());
                return Step::Stop;
            }
            self.need_barrier = false;
        }

        if self.shutdown.is_cancelled() {
            return Step::Stop;
        }

        let now = Instant::now();
        let muted_groups = self.mutes.muted_groups(now);
        let mut muted_nodes = self.mutes.muted_nodes(now);
        muted_nodes.extend(self.stale_nodes(config.node_mute_timeout()));
        metrics::update_muted(muted_groups.len(), muted_nodes.len());
        {
            let mut status = self.status.write();
            status.muted_groups = muted_groups.len();
            status.muted_nodes = muted_nodes.len();
        }

        let index = build_index(self.view.as_ref(), &mut self.last_leaders, now);
        let imbalance = self.strategy.imbalance(&index, &muted_nodes);
        metrics::update_imbalance(imbalance);

        let Some(reassignment) =
            self.strategy
                .compute_reassignment(&index, &muted_groups, &muted_nodes)
        else {
            debug!(
                "No leadership balance improvement, imbalance {}, muted groups {}, muted nodes {}",
                imbalance,
                muted_groups.len(),
                muted_nodes.len()
            );
            metrics::record_no_improvement();
            self.status.write().no_improvement += 1;
            return Step::Stop;
        };

        debug!(
            "Moving leadership of {} (imbalance {})",
            reassignment, imbalance
        );

        let attempt = tokio::select! {
            outcome = self.executor.attempt_transfer(
                reassignment,
                config.transfer_timeout(),
                config.mute_timeout(),
                &mut self.mutes,
            ) => Some(outcome),
            _ = self.shutdown.cancelled() => None,
        };

        let Some(outcome) = attempt else {
            info!("Abandoning leadership transfer of {} on shutdown", reassignment);
            return Step::Stop;
        };

        let mut status = self.status.write();
        status.last_reassignment = Some(reassignment);
        match outcome.result {
            Ok(()) => {
                status.transfers_succeeded += 1;
                self.last_leaders.record(
                    reassignment.group,
                    reassignment.from,
                    reassignment.to,
                    Instant::now() + config.mute_timeout(),
                );
            }
            Err(e) => {
                status.transfers_failed += 1;
                status.last_error = Some(e.to_string());
            }
        }

        Step::Continue
    }

    /// Nodes whose controller heartbeat is older than `threshold`
    fn stale_nodes(&self, threshold: Duration) -> BTreeSet<NodeId> {
        self.view
            .nodes()
            .into_iter()
            .filter(|node| match self.view.heartbeat_age(*node) {
                Some(age) if age > threshold => {
                    info!(
                        "Leadership balancer muting node {} last heartbeat {} ms",
                        node,
                        age.as_millis()
                    );
                    true
                }
                _ => false,
            })
            .collect()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
