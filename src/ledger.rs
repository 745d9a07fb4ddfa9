//! Declarative workflow records and their interpreter.
//!
//! A [`WorkflowConfig`] names steps, the function each step runs and the
//! transition taken for every event the function can emit. [`Workflow`]
//! interprets such a record; [`WorkflowLedger`] accumulates the steps a run
//! committed and projects them into a replayable record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::WorkflowError;
use crate::model::{CommittedStep, RunStatus};

/// Name of the only terminal state.
pub const DONE: &str = "done";
/// Event a committed step emits when its criterion held.
pub const SUCCESS_EVENT: &str = "success";
/// Timeout event used by ledger projections.
pub const TIMEOUT_EVENT: &str = "timeout";

// ========================= Record =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMeta {
    pub title: String,
    pub start_step: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepDef {
    #[serde(default)]
    pub function_key: String,
    #[serde(default)]
    pub transitions: BTreeMap<String, String>,
    /// Zero disables the timeout race.
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub on_timeout_event: String,
}

impl WorkflowStepDef {
    pub fn terminal() -> Self {
        Self {
            function_key: String::new(),
            transitions: BTreeMap::new(),
            timeout_seconds: 0,
            on_timeout_event: String::new(),
        }
    }
}

/// One persisted workflow document per bot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub meta: WorkflowMeta,
    pub steps: BTreeMap<String, WorkflowStepDef>,
}

impl WorkflowConfig {
    /// Checks that `done` is terminal, the start step exists and every
    /// transition lands on a defined step.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        match self.steps.get(DONE) {
            Some(done) if done.transitions.is_empty() => {}
            Some(_) => {
                return Err(WorkflowError::InvalidConfig("'done' must have no transitions".into()));
            }
            None => return Err(WorkflowError::InvalidConfig("missing 'done' step".into())),
        }
        if !self.steps.contains_key(&self.meta.start_step) {
            return Err(WorkflowError::UnknownStep(self.meta.start_step.clone()));
        }
        for (name, def) in &self.steps {
            if name != DONE && def.transitions.is_empty() {
                return Err(WorkflowError::InvalidConfig(format!("step '{}' has no transitions", name)));
            }
            if let Some(target) = def.transitions.values().find(|t| !self.steps.contains_key(*t)) {
                return Err(WorkflowError::InvalidConfig(format!(
                    "step '{}' transitions to undefined '{}'",
                    name, target
                )));
            }
        }
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        if let Some(dir) = path.as_ref().parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path.as_ref(), serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }
}

// ========================= Interpreter =========================

/// Event emitted by a step function, looked up in the step's transitions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionEvent(pub String);

impl TransitionEvent {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransitionEvent {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A registered step: takes the run context, returns exactly one event.
#[async_trait]
pub trait StepFunction<C: Send>: Send + Sync {
    async fn call(&self, ctx: &mut C) -> TransitionEvent;
}

/// Adapts a synchronous closure into a [`StepFunction`].
pub struct FnStep<F>(pub F);

#[async_trait]
impl<C, F> StepFunction<C> for FnStep<F>
where
    C: Send,
    F: Fn(&mut C) -> TransitionEvent + Send + Sync,
{
    async fn call(&self, ctx: &mut C) -> TransitionEvent {
        (self.0)(ctx)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub event: String,
    pub to: String,
    pub timed_out: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub transitions: Vec<Transition>,
}

impl WorkflowOutcome {
    pub fn executed(&self) -> usize {
        self.transitions.len()
    }
}

pub struct Workflow<C: Send> {
    config: WorkflowConfig,
    registry: HashMap<String, Arc<dyn StepFunction<C>>>,
    max_steps: usize,
}

impl<C: Send> Workflow<C> {
    pub fn new(config: WorkflowConfig, max_steps: usize) -> Self {
        Self { config, registry: HashMap::new(), max_steps }
    }

    pub fn register(&mut self, key: impl Into<String>, function: Arc<dyn StepFunction<C>>) -> &mut Self {
        self.registry.insert(key.into(), function);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs one step, racing its timeout, and resolves the transition it takes.
    pub async fn execute_step(&self, name: &str, ctx: &mut C) -> Result<Transition, WorkflowError> {
        let def = self
            .config
            .steps
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownStep(name.to_string()))?;
        let function = self.registry.get(&def.function_key).ok_or_else(|| {
            WorkflowError::UnregisteredFunction { step: name.to_string(), key: def.function_key.clone() }
        })?;

        let (event, timed_out) = if def.timeout_seconds == 0 {
            (function.call(ctx).await, false)
        } else {
            match timeout(Duration::from_secs(def.timeout_seconds), function.call(ctx)).await {
                Ok(event) => (event, false),
                Err(_) => {
                    warn!(step = name, timeout_s = def.timeout_seconds, "step timed out");
                    (TransitionEvent::new(def.on_timeout_event.clone()), true)
                }
            }
        };

        let next = def.transitions.get(event.as_str()).ok_or_else(|| {
            WorkflowError::UnknownTransition { step: name.to_string(), event: event.0.clone() }
        })?;
        debug!(step = name, event = event.as_str(), next = %next, "transition");
        Ok(Transition { from: name.to_string(), event: event.0, to: next.clone(), timed_out })
    }

    /// Interprets the record from its start step until `done`.
    pub async fn run(&self, ctx: &mut C) -> Result<WorkflowOutcome, WorkflowError> {
        let mut outcome = WorkflowOutcome::default();
        let mut current = self.config.meta.start_step.clone();
        while current != DONE {
            if outcome.executed() >= self.max_steps {
                warn!(limit = self.max_steps, at = %current, "workflow step ceiling reached");
                return Err(WorkflowError::BudgetExceeded { limit: self.max_steps });
            }
            let transition = self.execute_step(&current, ctx).await?;
            current = transition.to.clone();
            outcome.transitions.push(transition);
        }
        info!(title = %self.config.meta.title, steps = outcome.executed(), "workflow finished");
        Ok(outcome)
    }
}

// ========================= Ledger =========================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub name: String,
    pub function_key: String,
    pub timeout_seconds: u64,
    pub step: CommittedStep,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalMarker {
    pub status: RunStatus,
    pub reason: String,
}

/// Append-only record of the steps a run committed.
///
/// Entries are never edited; transitions are derived from their order when
/// the ledger is projected into a [`WorkflowConfig`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowLedger {
    title: String,
    entries: Vec<LedgerEntry>,
    terminal: Option<TerminalMarker>,
}

impl WorkflowLedger {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), entries: Vec::new(), terminal: None }
    }

    pub fn step_name(index: usize) -> String {
        format!("step_{:03}", index + 1)
    }

    pub fn function_key(name: &str) -> String {
        format!("replay:{}", name)
    }

    /// Appends a committed step. Returns `false` once the ledger is sealed.
    pub fn commit(&mut self, step: CommittedStep, timeout_seconds: u64) -> bool {
        if self.terminal.is_some() {
            warn!("commit after terminal marker ignored");
            return false;
        }
        let name = Self::step_name(self.entries.len());
        self.entries.push(LedgerEntry {
            function_key: Self::function_key(&name),
            name,
            timeout_seconds,
            step,
        });
        true
    }

    pub fn seal(&mut self, status: RunStatus, reason: impl Into<String>) {
        if self.terminal.is_none() {
            self.terminal = Some(TerminalMarker { status, reason: reason.into() });
        }
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn terminal(&self) -> Option<&TerminalMarker> {
        self.terminal.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Workflow record that walks the committed steps in order and ends in `done`.
    pub fn to_config(&self) -> WorkflowConfig {
        let mut steps = BTreeMap::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let next = self.entries.get(i + 1).map(|e| e.name.clone()).unwrap_or_else(|| DONE.to_string());
            let mut transitions = BTreeMap::new();
            transitions.insert(SUCCESS_EVENT.to_string(), next);
            steps.insert(
                entry.name.clone(),
                WorkflowStepDef {
                    function_key: entry.function_key.clone(),
                    transitions,
                    timeout_seconds: entry.timeout_seconds,
                    on_timeout_event: TIMEOUT_EVENT.to_string(),
                },
            );
        }
        steps.insert(DONE.to_string(), WorkflowStepDef::terminal());
        let start_step = self.entries.first().map(|e| e.name.clone()).unwrap_or_else(|| DONE.to_string());
        WorkflowConfig { meta: WorkflowMeta { title: self.title.clone(), start_step }, steps }
    }
}
