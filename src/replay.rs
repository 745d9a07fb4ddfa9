//! Re-running a committed workflow record against a live page.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{EngineConfig, ExecutorConfig, ResolverConfig};
use crate::driver::BrowserDriver;
use crate::error::WorkflowError;
use crate::executor::StepExecutor;
use crate::ledger::{StepFunction, TransitionEvent, Workflow, WorkflowConfig, WorkflowLedger, WorkflowOutcome};
use crate::model::{CommittedStep, ExecutionResult, PageState};
use crate::selector::{SelectorChain, SelectorResolver};

/// Context threaded through replayed steps.
pub struct ReplayContext<'a, D: BrowserDriver> {
    driver: &'a D,
    resolver: ResolverConfig,
    executor: ExecutorConfig,
    pub results: Vec<ExecutionResult>,
}

impl<'a, D: BrowserDriver> ReplayContext<'a, D> {
    pub fn new(driver: &'a D, cfg: &EngineConfig) -> Self {
        Self {
            driver,
            resolver: cfg.resolver.clone(),
            executor: cfg.executor.clone(),
            results: Vec::new(),
        }
    }
}

/// Step function that performs one committed step again.
pub struct ReplayStep {
    step: CommittedStep,
}

impl ReplayStep {
    pub fn new(step: CommittedStep) -> Self {
        Self { step }
    }

    fn chain(&self) -> Option<SelectorChain> {
        self.step
            .chain
            .clone()
            .or_else(|| self.step.target.clone().map(|d| SelectorChain::new(d, Vec::new())))
    }
}

#[async_trait]
impl<'a, D: BrowserDriver> StepFunction<ReplayContext<'a, D>> for ReplayStep {
    async fn call(&self, ctx: &mut ReplayContext<'a, D>) -> TransitionEvent {
        let resolver = SelectorResolver::new(ctx.driver, ctx.resolver.clone());
        let executor = StepExecutor::new(ctx.driver, ctx.executor.clone());
        let before = match timeout(ctx.executor.page_state_timeout(), ctx.driver.page_state()).await {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                warn!("page state unavailable before replay step: {}", e);
                PageState::default()
            }
            Err(_) => {
                warn!("page state read timed out before replay step");
                PageState::default()
            }
        };
        let chain = self.chain();
        let result = executor
            .run_step(&resolver, &self.step.to_plan_step(), chain.as_ref(), &before)
            .await;
        let event = TransitionEvent::new(result.event.tag());
        ctx.results.push(result);
        event
    }
}

pub struct ReplayOutcome {
    pub workflow: WorkflowOutcome,
    pub results: Vec<ExecutionResult>,
}

/// Replays `steps` as wired by `config`.
///
/// Step `step_NNN` runs `steps[NNN - 1]`. A step whose event has no
/// transition (any failure, or a timeout) halts the replay with
/// [`WorkflowError::UnknownTransition`].
pub async fn replay<D: BrowserDriver>(
    driver: &D,
    config: &WorkflowConfig,
    steps: &[CommittedStep],
    cfg: &EngineConfig,
) -> Result<ReplayOutcome, WorkflowError> {
    config.validate()?;
    let mut workflow: Workflow<ReplayContext<'_, D>> = Workflow::new(config.clone(), cfg.workflow_max_steps);
    for (i, step) in steps.iter().enumerate() {
        let key = WorkflowLedger::function_key(&WorkflowLedger::step_name(i));
        workflow.register(key, Arc::new(ReplayStep::new(step.clone())));
    }

    info!(title = %config.meta.title, steps = steps.len(), "replaying workflow");
    let mut ctx = ReplayContext::new(driver, cfg);
    let outcome = workflow.run(&mut ctx).await?;
    Ok(ReplayOutcome { workflow: outcome, results: ctx.results })
}

/// Projects `ledger` and replays it.
pub async fn replay_ledger<D: BrowserDriver>(
    driver: &D,
    ledger: &WorkflowLedger,
    cfg: &EngineConfig,
) -> Result<ReplayOutcome, WorkflowError> {
    let steps: Vec<CommittedStep> = ledger.entries().iter().map(|e| e.step.clone()).collect();
    replay(driver, &ledger.to_config(), &steps, cfg).await
}
