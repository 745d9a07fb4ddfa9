use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Smallest micro-plan the controller will execute.
pub const MIN_PLAN_STEPS: usize = 3;
/// Largest micro-plan the controller will execute.
pub const MAX_PLAN_STEPS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budgets {
    /// Micro-plans issued (proposals and revisions) before the run is aborted.
    pub max_plans: u32,
    /// Committed steps before the run is aborted.
    pub max_committed_steps: u32,
}

impl Default for Budgets {
    fn default() -> Self {
        Self { max_plans: 20, max_committed_steps: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Deadline for the primary descriptor.
    pub primary_timeout_ms: u64,
    /// Deadline for each fallback descriptor.
    pub fallback_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { primary_timeout_ms: 5_000, fallback_timeout_ms: 1_500, poll_interval_ms: 100 }
    }
}

impl ResolverConfig {
    pub fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Worst-case time to walk a chain of `descriptors` entries.
    pub fn chain_bound(&self, descriptors: usize) -> Duration {
        if descriptors == 0 {
            return Duration::ZERO;
        }
        let fallback = self.fallback_timeout().min(self.primary_timeout());
        self.primary_timeout() + fallback * (descriptors as u32 - 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub action_timeout_ms: u64,
    /// Upper bound on waiting for the page to settle; reaching it is not an error.
    pub settle_timeout_ms: u64,
    /// How long a test criterion may take to start holding.
    pub verify_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Bound on reading url and title around a step.
    #[serde(default = "default_page_state_timeout_ms")]
    pub page_state_timeout_ms: u64,
}

fn default_page_state_timeout_ms() -> u64 {
    2_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: 10_000,
            settle_timeout_ms: 3_000,
            verify_timeout_ms: 5_000,
            poll_interval_ms: 150,
            page_state_timeout_ms: default_page_state_timeout_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn page_state_timeout(&self) -> Duration {
        Duration::from_millis(self.page_state_timeout_ms)
    }

    /// Worst-case wall time of one step once its target is resolved.
    pub fn step_bound(&self) -> Duration {
        self.action_timeout()
            + self.settle_timeout()
            + self.verify_timeout()
            + self.page_state_timeout()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub budgets: Budgets,
    pub resolver: ResolverConfig,
    pub executor: ExecutorConfig,
    /// Ceiling on interpreted steps when running a workflow record.
    #[serde(default = "default_workflow_max_steps")]
    pub workflow_max_steps: usize,
}

fn default_workflow_max_steps() -> usize {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budgets: Budgets::default(),
            resolver: ResolverConfig::default(),
            executor: ExecutorConfig::default(),
            workflow_max_steps: default_workflow_max_steps(),
        }
    }
}

impl EngineConfig {
    /// Worst-case wall time of replaying one step whose chain has
    /// `descriptors` entries: reading the page, resolving, acting, verifying.
    pub fn replay_bound(&self, descriptors: usize) -> Duration {
        self.executor.page_state_timeout()
            + self.resolver.chain_bound(descriptors)
            + self.executor.step_bound()
    }

    /// Replay bound in whole seconds, never zero.
    pub fn replay_timeout_secs(&self, descriptors: usize) -> u64 {
        (self.replay_bound(descriptors).as_millis() as u64).div_ceil(1000).max(1)
    }

    /// Defaults overlaid with `PILOT_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        overlay(&mut cfg.budgets.max_plans, "PILOT_MAX_PLANS");
        overlay(&mut cfg.budgets.max_committed_steps, "PILOT_MAX_STEPS");
        overlay(&mut cfg.resolver.primary_timeout_ms, "PILOT_PRIMARY_TIMEOUT_MS");
        overlay(&mut cfg.resolver.fallback_timeout_ms, "PILOT_FALLBACK_TIMEOUT_MS");
        overlay(&mut cfg.executor.action_timeout_ms, "PILOT_ACTION_TIMEOUT_MS");
        overlay(&mut cfg.executor.settle_timeout_ms, "PILOT_SETTLE_TIMEOUT_MS");
        overlay(&mut cfg.executor.verify_timeout_ms, "PILOT_VERIFY_TIMEOUT_MS");
        overlay(&mut cfg.executor.page_state_timeout_ms, "PILOT_PAGE_STATE_TIMEOUT_MS");
        overlay(&mut cfg.workflow_max_steps, "PILOT_WORKFLOW_MAX_STEPS");
        cfg
    }
}

fn overlay<T: FromStr>(slot: &mut T, var: &str) {
    if let Some(v) = env::var(var).ok().and_then(|s| s.trim().parse().ok()) {
        *slot = v;
    }
}
