//! Runtime configuration for the orchestration core.
//!
//! Defaults are layered under `OPFLOW_*` environment overrides via the
//! `config` crate, so an embedding process can tune queue concurrency or
//! retry budgets without recompiling.

use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

/// Queue name the saga workflow engine consumes.
pub const CONTROLLER_QUEUE: &str = "controller";

/// Topic used to broadcast task envelopes to every connected agent.
pub const AGENT_BROADCAST_TOPIC: &str = "agents.all";

/// Configuration for the dispatcher, transport and saga engine.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Connection string for the operation store (Postgres deployments).
    pub database_url: String,
    /// Concurrent workers per consumed queue.
    pub queue_concurrency: usize,
    /// Delivery attempts before a message is declared poison.
    pub max_delivery_attempts: u32,
    /// Seconds a saga may stay `Queued` before it is failed with a
    /// timeout reason. `None` (the default) disables the deadline.
    pub acceptance_timeout_secs: Option<u64>,
    /// Fail an operation whose addressed command has no resolvable agent
    /// instead of leaving it `Queued`.
    pub fail_on_unresolved_agent: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/opflow_development".to_string(),
            queue_concurrency: 5,
            max_delivery_attempts: 3,
            acceptance_timeout_secs: None,
            fail_on_unresolved_agent: false,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from defaults plus `OPFLOW_*` environment
    /// overrides (e.g. `OPFLOW_QUEUE_CONCURRENCY=10`).
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        Config::builder()
            .set_default("database_url", defaults.database_url)?
            .set_default("queue_concurrency", defaults.queue_concurrency as i64)?
            .set_default("max_delivery_attempts", defaults.max_delivery_attempts as i64)?
            .set_default("acceptance_timeout_secs", None::<i64>)?
            .set_default("fail_on_unresolved_agent", defaults.fail_on_unresolved_agent)?
            .add_source(Environment::with_prefix("OPFLOW"))
            .build()?
            .try_deserialize()
    }

    /// Acceptance deadline as a [`Duration`], when configured.
    pub fn acceptance_timeout(&self) -> Option<Duration> {
        self.acceptance_timeout_secs.map(Duration::from_secs)
    }
}
