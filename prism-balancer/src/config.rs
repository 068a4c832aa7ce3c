//! Leader balancer configuration
//!
//! Values are read through a [`ConfigWatch`] each time the control loop is
//! about to wait or decide, so updates published on the paired
//! [`ConfigHandle`] take effect without a restart. A change never shortens or
//! extends a wait that is already in progress.

use crate::error::{BalancerError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Which balancing strategy to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Even out leader counts per shard
    #[default]
    GreedyBalancedShards,
    /// Even out leader counts per node
    GreedyBalancedNodes,
}

/// Leader balancer configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BalancerConfig {
    /// On/off switch; when off the loop keeps ticking but does nothing
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Low frequency safety-net tick interval in milliseconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Cooldown applied to a group after any transfer attempt, in milliseconds
    #[serde(default = "default_mute_timeout")]
    pub mute_timeout_ms: u64,

    /// Heartbeat age after which a node is muted, in milliseconds
    #[serde(default = "default_node_mute_timeout")]
    pub node_mute_timeout_ms: u64,

    /// Delay between gaining controller leadership and the first tick
    #[serde(default = "default_activation_delay")]
    pub activation_delay_ms: u64,

    /// Upper bound on a single leadership transfer, in milliseconds
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_ms: u64,

    /// Balancing strategy
    #[serde(default)]
    pub strategy: StrategyKind,
}

fn default_enabled() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    120_000
}

fn default_mute_timeout() -> u64 {
    300_000
}

fn default_node_mute_timeout() -> u64 {
    20_000
}

fn default_activation_delay() -> u64 {
    30_000
}

fn default_transfer_timeout() -> u64 {
    30_000
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            idle_timeout_ms: default_idle_timeout(),
            mute_timeout_ms: default_mute_timeout(),
            node_mute_timeout_ms: default_node_mute_timeout(),
            activation_delay_ms: default_activation_delay(),
            transfer_timeout_ms: default_transfer_timeout(),
            strategy: StrategyKind::default(),
        }
    }
}

impl BalancerConfig {
    /// Parse a standalone TOML table
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: BalancerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the loop spin
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_ms == 0 {
            return Err(BalancerError::Config(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.transfer_timeout_ms == 0 {
            return Err(BalancerError::Config(
                "transfer_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn mute_timeout(&self) -> Duration {
        Duration::from_millis(self.mute_timeout_ms)
    }

    pub fn node_mute_timeout(&self) -> Duration {
        Duration::from_millis(self.node_mute_timeout_ms)
    }

    pub fn activation_delay(&self) -> Duration {
        Duration::from_millis(self.activation_delay_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// Owner side of a live configuration binding
#[derive(Debug)]
pub struct ConfigHandle {
    tx: watch::Sender<BalancerConfig>,
}

/// Read side of a live configuration binding
#[derive(Debug, Clone)]
pub struct ConfigWatch {
    rx: watch::Receiver<BalancerConfig>,
}

/// Create a live configuration binding seeded with `config`
pub fn binding(config: BalancerConfig) -> (ConfigHandle, ConfigWatch) {
    let (tx, rx) = watch::channel(config);
    (ConfigHandle { tx }, ConfigWatch { rx })
}

impl ConfigHandle {
    /// Replace the whole configuration
    pub fn update(&self, config: BalancerConfig) -> Result<()> {
        config.validate()?;
        self.tx.send_replace(config);
        Ok(())
    }

    /// Flip the on/off switch
    pub fn set_enabled(&self, enabled: bool) {
        self.tx.send_if_modified(|config| {
            if config.enabled == enabled {
                return false;
            }
            config.enabled = enabled;
            true
        });
    }

    /// Create another reader
    pub fn watch(&self) -> ConfigWatch {
        ConfigWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl ConfigWatch {
    /// A reader that never changes, for callers without live reload
    pub fn fixed(config: BalancerConfig) -> Self {
        let (_, rx) = watch::channel(config);
        Self { rx }
    }

    /// Snapshot of the current configuration
    pub fn current(&self) -> BalancerConfig {
        self.rx.borrow().clone()
    }

    pub fn enabled(&self) -> bool {
        self.rx.borrow().enabled
    }

    /// Wait until the configuration is replaced.
    ///
    /// Pends forever once the owning handle has been dropped.
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
