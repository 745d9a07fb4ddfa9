//! The plan loop: snapshot, goal check, plan, human gate, execute, commit.
//!
//! The controller exclusively owns the browser session, the run context and
//! the workflow ledger for the lifetime of a run. Plans are small and the
//! unit of retry is a fresh plan from a fresh snapshot; a failed step is
//! never retried in place.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::driver::{BrowserDriver, PageInspector};
use crate::error::{Budget, RunError};
use crate::executor::StepExecutor;
use crate::gate::{AutoApprove, Decision, HumanGate};
use crate::ledger::{WorkflowConfig, WorkflowLedger};
use crate::model::{
    BotRunContext, CommittedStep, ExecutionResult, FailureRecord, MicroPlan, PageSnapshot,
    PlanStep, RunStatus, TerminationReason,
};
use crate::planner::Planner;
use crate::replay::{self, ReplayOutcome};
use crate::selector::{SelectorChain, SelectorResolver};
use crate::store::{NullRunStore, RunStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Snapshotting,
    Planning,
    AwaitingApproval,
    Executing,
    Committing,
    Done,
    Aborted,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub goal: String,
    pub target_url: String,
    pub status: RunStatus,
    pub reason: TerminationReason,
    pub history: Vec<CommittedStep>,
    pub failures: Vec<FailureRecord>,
    pub last_error: Option<FailureRecord>,
    pub plans_issued: u32,
    pub steps_committed: u32,
    pub elapsed_ms: u128,
    /// Every state the controller entered, in order.
    pub states: Vec<ControllerState>,
    /// Replayable record of the committed steps.
    pub workflow: WorkflowConfig,
    /// Set when the final report could not be persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
}

impl RunReport {
    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }
}

struct RunState {
    ctx: BotRunContext,
    ledger: WorkflowLedger,
    states: Vec<ControllerState>,
}

impl RunState {
    fn enter(&mut self, state: ControllerState) {
        debug!(run = %self.ctx.run_id, state = ?state, "controller state");
        self.states.push(state);
    }
}

pub struct PlanLoopController<D, I, P, G, S>
where
    D: BrowserDriver,
    I: PageInspector<D>,
    P: Planner,
    G: HumanGate,
    S: RunStore,
{
    driver: D,
    inspector: I,
    planner: P,
    gate: G,
    store: S,
    cfg: EngineConfig,
}

impl<D, I, P, G, S> PlanLoopController<D, I, P, G, S>
where
    D: BrowserDriver,
    I: PageInspector<D>,
    P: Planner,
    G: HumanGate,
    S: RunStore,
{
    pub fn new(driver: D, inspector: I, planner: P, gate: G, store: S, cfg: EngineConfig) -> Self {
        Self { driver, inspector, planner, gate, store, cfg }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Drives one run to a terminal status and reports it. Every outcome,
    /// including a failure to persist the final report, is in the report.
    pub async fn run(&self, goal: &str, target_url: &str) -> RunReport {
        let start = Instant::now();
        let mut run = RunState {
            ctx: BotRunContext::new(nanoid!(), goal, target_url),
            ledger: WorkflowLedger::new(goal),
            states: Vec::new(),
        };
        run.enter(ControllerState::Idle);
        info!(run = %run.ctx.run_id, goal, url = target_url, "run started");

        let reason = match self.drive(&mut run).await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(run = %run.ctx.run_id, "run ending: {}", e);
                termination_for(e)
            }
        };
        self.finish(run, reason, start).await
    }

    /// Re-executes committed steps through the workflow interpreter.
    pub async fn replay(
        &self,
        workflow: &WorkflowConfig,
        steps: &[CommittedStep],
    ) -> Result<ReplayOutcome, RunError> {
        Ok(replay::replay(&self.driver, workflow, steps, &self.cfg).await?)
    }

    async fn drive(&self, run: &mut RunState) -> Result<TerminationReason, RunError> {
        self.store.write_run_start(&run.ctx).await?;
        if !run.ctx.target_url.is_empty() {
            self.driver.navigate(&run.ctx.target_url).await?;
        }

        loop {
            run.enter(ControllerState::Snapshotting);
            let snapshot = self.inspector.snapshot(&self.driver).await?;
            debug!(url = %snapshot.url, elements = snapshot.elements.len(), "snapshot taken");

            if self.planner.is_goal_fulfilled(&run.ctx.goal, &snapshot).await? {
                info!(run = %run.ctx.run_id, committed = run.ctx.steps_committed, "goal fulfilled");
                return Ok(TerminationReason::GoalFulfilled);
            }
            self.check_budgets(&run.ctx)?;

            run.enter(ControllerState::Planning);
            let Some(plan) = self.approved_plan(run, &snapshot).await? else {
                continue;
            };

            run.enter(ControllerState::Executing);
            self.execute_plan(run, &plan, &snapshot).await?;
        }
    }

    fn check_budgets(&self, ctx: &BotRunContext) -> Result<(), RunError> {
        if ctx.plans_issued >= self.cfg.budgets.max_plans {
            warn!(plans = ctx.plans_issued, "plan budget exhausted");
            return Err(RunError::BudgetExceeded(Budget::Plans));
        }
        if ctx.steps_committed >= self.cfg.budgets.max_committed_steps {
            warn!(steps = ctx.steps_committed, "step budget exhausted");
            return Err(RunError::BudgetExceeded(Budget::Steps));
        }
        Ok(())
    }

    /// Proposes a plan and loops through the human gate until it is approved.
    ///
    /// `Ok(None)` means the plan was malformed and a fresh cycle should start.
    async fn approved_plan(
        &self,
        run: &mut RunState,
        snapshot: &PageSnapshot,
    ) -> Result<Option<MicroPlan>, RunError> {
        let history = run.ctx.history_descriptions();
        let mut plan = self
            .planner
            .propose_micro_plan(&run.ctx.goal, snapshot, &history)
            .await?;
        run.ctx.plans_issued += 1;
        info!(plan = run.ctx.plans_issued, steps = plan.steps.len(), "micro-plan proposed");

        loop {
            if let Err(e) = plan.validate() {
                warn!(plan = run.ctx.plans_issued, "micro-plan rejected: {}", e);
                run.ctx.failures.push(FailureRecord {
                    plan: run.ctx.plans_issued,
                    step: None,
                    description: "micro-plan validation".to_string(),
                    kind: None,
                    message: e.to_string(),
                    url: snapshot.url.clone(),
                    diagnosis: None,
                });
                return Ok(None);
            }

            run.enter(ControllerState::AwaitingApproval);
            match self.gate.present(&plan).await {
                Decision::Approve => {
                    info!(plan = run.ctx.plans_issued, "micro-plan approved");
                    return Ok(Some(plan));
                }
                Decision::Cancel => {
                    info!(plan = run.ctx.plans_issued, "micro-plan cancelled");
                    return Err(RunError::UserCancelled);
                }
                Decision::Modify(feedback) => {
                    info!(plan = run.ctx.plans_issued, feedback = %feedback, "revision requested");
                    if run.ctx.plans_issued >= self.cfg.budgets.max_plans {
                        return Err(RunError::BudgetExceeded(Budget::Plans));
                    }
                    run.enter(ControllerState::Planning);
                    plan = self.planner.revise_micro_plan(&plan, &feedback).await?;
                    run.ctx.plans_issued += 1;
                }
            }
        }
    }

    /// Executes steps in order, committing each success, and stops the plan
    /// at its first failure.
    async fn execute_plan(
        &self,
        run: &mut RunState,
        plan: &MicroPlan,
        snapshot: &PageSnapshot,
    ) -> Result<(), RunError> {
        let resolver = SelectorResolver::new(&self.driver, self.cfg.resolver.clone());
        let executor = StepExecutor::new(&self.driver, self.cfg.executor.clone());
        let plan_no = run.ctx.plans_issued;
        let mut before = snapshot.state();

        for (i, step) in plan.steps.iter().enumerate() {
            if run.ctx.steps_committed >= self.cfg.budgets.max_committed_steps {
                info!(plan = plan_no, remaining = plan.steps.len() - i, "step budget reached mid-plan");
                return Ok(());
            }
            let chain = step.target_chain(snapshot);
            info!(plan = plan_no, step = i, "{}", step.description);
            let result = executor.run_step(&resolver, step, chain.as_ref(), &before).await;

            if !result.success || result.action.is_none() {
                self.record_failure(run, plan_no, i, step, &result).await;
                return Ok(());
            }

            run.enter(ControllerState::Committing);
            self.commit(run, plan_no, step, chain, &result).await?;
            before = result.page;
            if i + 1 < plan.steps.len() {
                run.enter(ControllerState::Executing);
            }
        }
        Ok(())
    }

    /// Records a verified step in the ledger and the run history, in that
    /// order, then checkpoints both.
    async fn commit(
        &self,
        run: &mut RunState,
        plan_no: u32,
        step: &PlanStep,
        chain: Option<SelectorChain>,
        result: &ExecutionResult,
    ) -> Result<(), RunError> {
        let Some(action) = result.action else {
            return Err(RunError::ConfigurationError("commit without an action".into()));
        };
        let committed = CommittedStep {
            index: run.ctx.history.len(),
            plan: plan_no,
            description: step.description.clone(),
            purpose: step.purpose.clone(),
            action,
            target: result.target.clone(),
            chain: if action.needs_target() { chain } else { None },
            value: step.value.clone(),
            test_criterion: step.test_criterion.clone(),
            event: result.event,
            url_after: result.page.url.clone(),
        };
        let descriptors = match &committed.chain {
            Some(chain) => chain.len(),
            None => usize::from(committed.target.is_some()),
        };
        let timeout_secs = self.cfg.replay_timeout_secs(descriptors);
        append_to_ledger(&mut run.ledger, committed.clone(), timeout_secs)?;
        run.ctx.history.push(committed);
        run.ctx.steps_committed += 1;
        info!(
            plan = plan_no,
            committed = run.ctx.steps_committed,
            url = %result.page.url,
            "step committed"
        );
        self.store.checkpoint(&run.ctx, &run.ledger.to_config()).await
    }

    async fn record_failure(
        &self,
        run: &mut RunState,
        plan_no: u32,
        index: usize,
        step: &PlanStep,
        result: &ExecutionResult,
    ) {
        let mut record = FailureRecord {
            plan: plan_no,
            step: Some(index),
            description: step.description.clone(),
            kind: result.error,
            message: result.message.clone().unwrap_or_default(),
            url: result.page.url.clone(),
            diagnosis: None,
        };
        match self.planner.diagnose(&record).await {
            Ok(hint) => {
                let text = match hint.suggestion {
                    Some(s) if !s.is_empty() => format!("{} ({})", hint.summary, s),
                    _ => hint.summary,
                };
                info!(plan = plan_no, step = index, "diagnosis: {}", text);
                record.diagnosis = Some(text);
            }
            Err(e) => warn!("diagnosis unavailable: {}", e),
        }

        match self.driver.screenshot_b64().await {
            Ok(Some(png)) => {
                let label = format!("failure_{:03}", run.ctx.failures.len() + 1);
                if let Err(e) = self.store.save_evidence(&run.ctx.run_id, &label, &png).await {
                    warn!("evidence not saved: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => debug!("no screenshot: {}", e),
        }

        warn!(
            plan = plan_no,
            step = index,
            kind = ?result.error,
            "step failed, replanning from a fresh snapshot"
        );
        run.ctx.failures.push(record);
    }

    async fn finish(
        &self,
        mut run: RunState,
        reason: TerminationReason,
        start: Instant,
    ) -> RunReport {
        let status = reason.status();
        run.enter(match status {
            RunStatus::Done => ControllerState::Done,
            RunStatus::Aborted => ControllerState::Aborted,
            RunStatus::Failed => ControllerState::Failed,
        });
        run.ledger.seal(status, format!("{:?}", reason));

        let RunState { ctx, ledger, states } = run;
        let mut report = RunReport {
            workflow: ledger.to_config(),
            last_error: ctx.failures.last().cloned(),
            run_id: ctx.run_id,
            goal: ctx.goal,
            target_url: ctx.target_url,
            status,
            reason,
            history: ctx.history,
            failures: ctx.failures,
            plans_issued: ctx.plans_issued,
            steps_committed: ctx.steps_committed,
            elapsed_ms: start.elapsed().as_millis(),
            states,
            persistence_error: None,
        };
        if let Err(e) = self.store.write_run_end(&report).await {
            warn!(run = %report.run_id, "final report not persisted: {}", e);
            report.persistence_error = Some(e.to_string());
        }
        info!(
            run = %report.run_id,
            status = ?report.status,
            committed = report.steps_committed,
            plans = report.plans_issued,
            "run finished"
        );
        report
    }
}

impl<D, I, P> PlanLoopController<D, I, P, AutoApprove, NullRunStore>
where
    D: BrowserDriver,
    I: PageInspector<D>,
    P: Planner,
{
    /// Unattended controller: every plan is approved and nothing is persisted.
    pub fn with_defaults(driver: D, inspector: I, planner: P, cfg: EngineConfig) -> Self {
        Self::new(driver, inspector, planner, AutoApprove, NullRunStore, cfg)
    }
}

impl<D, I, P, G> PlanLoopController<D, I, P, G, NullRunStore>
where
    D: BrowserDriver,
    I: PageInspector<D>,
    P: Planner,
    G: HumanGate,
{
    pub fn with_store<S: RunStore>(self, store: S) -> PlanLoopController<D, I, P, G, S> {
        PlanLoopController::new(self.driver, self.inspector, self.planner, self.gate, store, self.cfg)
    }
}

fn append_to_ledger(
    ledger: &mut WorkflowLedger,
    step: CommittedStep,
    timeout_secs: u64,
) -> Result<(), RunError> {
    if ledger.commit(step, timeout_secs) {
        Ok(())
    } else {
        Err(RunError::ConfigurationError("ledger is sealed; step not committed".into()))
    }
}

fn termination_for(e: RunError) -> TerminationReason {
    match e {
        RunError::PlannerUnavailable(m) => TerminationReason::PlannerUnavailable(m),
        RunError::BudgetExceeded(b) => TerminationReason::BudgetExceeded(b),
        RunError::UserCancelled => TerminationReason::UserCancelled,
        RunError::ConfigurationError(m) => TerminationReason::Configuration(m),
        RunError::Driver(e) => TerminationReason::Driver(e.to_string()),
        RunError::Persistence(m) => TerminationReason::Persistence(m),
    }
}
