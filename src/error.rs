use serde::{Deserialize, Serialize};
use thiserror::Error;

// ========================= Browser =========================

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum DriverError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element is stale or detached: {0}")]
    Stale(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("snapshot failed: {0}")]
    Snapshot(String),
    #[error("browser error: {0}")]
    Other(String),
}

// ========================= Per-step (recoverable) =========================

/// Serialisable tag of a per-step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    NotFound,
    ActionIndeterminate,
    ActionFailed,
    VerificationFailed,
}

impl StepErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepErrorKind::NotFound => "not_found",
            StepErrorKind::ActionIndeterminate => "action_indeterminate",
            StepErrorKind::ActionFailed => "action_failed",
            StepErrorKind::VerificationFailed => "verification_failed",
        }
    }
}

/// Failures a single plan step can end with. None of them ends the run; the
/// controller converts each into a replan.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepError {
    #[error("no selector candidate matched: {0}")]
    NotFound(String),
    #[error("target found but no action could be determined: {0}")]
    ActionIndeterminate(String),
    #[error("action failed: {0}")]
    ActionFailed(String),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

impl StepError {
    pub fn kind(&self) -> StepErrorKind {
        match self {
            StepError::NotFound(_) => StepErrorKind::NotFound,
            StepError::ActionIndeterminate(_) => StepErrorKind::ActionIndeterminate,
            StepError::ActionFailed(_) => StepErrorKind::ActionFailed,
            StepError::VerificationFailed(_) => StepErrorKind::VerificationFailed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::NotFound(m)
            | StepError::ActionIndeterminate(m)
            | StepError::ActionFailed(m)
            | StepError::VerificationFailed(m) => m,
        }
    }
}

// ========================= Plans & oracle =========================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("micro-plan has {got} steps, expected between {min} and {max}")]
    Size { got: usize, min: usize, max: usize },
    #[error("step {index} has no test criterion")]
    MissingCriterion { index: usize },
    #[error("step {index} has an empty description")]
    EmptyDescription { index: usize },
}

#[derive(Debug, Error, Clone)]
pub enum PlannerError {
    #[error("planner transport error: {0}")]
    Transport(String),
    #[error("planner returned an unreadable reply: {0}")]
    Decode(String),
}

// ========================= Workflow interpreter =========================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("step '{0}' is not defined")]
    UnknownStep(String),
    #[error("step '{step}' uses unregistered function '{key}'")]
    UnregisteredFunction { step: String, key: String },
    #[error("step '{step}' emitted '{event}' which has no transition")]
    UnknownTransition { step: String, event: String },
    #[error("workflow exceeded {limit} executed steps")]
    BudgetExceeded { limit: usize },
    #[error("invalid workflow: {0}")]
    InvalidConfig(String),
}

// ========================= Run (fatal) =========================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Plans,
    Steps,
    WorkflowSteps,
}

#[derive(Debug, Error, Clone)]
pub enum RunError {
    #[error("planner unavailable: {0}")]
    PlannerUnavailable(String),
    #[error("budget exceeded: {0:?}")]
    BudgetExceeded(Budget),
    #[error("cancelled by user")]
    UserCancelled,
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("browser error: {0}")]
    Driver(#[from] DriverError),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<PlannerError> for RunError {
    fn from(e: PlannerError) -> Self {
        RunError::PlannerUnavailable(e.to_string())
    }
}

impl From<WorkflowError> for RunError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::BudgetExceeded { .. } => RunError::BudgetExceeded(Budget::WorkflowSteps),
            other => RunError::ConfigurationError(other.to_string()),
        }
    }
}
