pub mod browser;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod executor;
pub mod gate;
pub mod ledger;
pub mod llm;
pub mod model;
pub mod planner;
pub mod replay;
pub mod selector;
pub mod store;

pub use browser::{BrowserConfig, ChromiumDriver, DomInspector};
pub use config::EngineConfig;
pub use controller::{ControllerState, PlanLoopController, RunReport};
pub use driver::{BrowserDriver, PageInspector};
pub use error::{RunError, StepError, StepErrorKind};
pub use gate::{AutoApprove, ConsoleGate, Decision, HumanGate};
pub use ledger::{Workflow, WorkflowConfig, WorkflowLedger};
pub use llm::{LlmConfig, LlmPlanner};
pub use model::{MicroPlan, PageSnapshot, PlanStep, RunStatus, TerminationReason};
pub use planner::Planner;
pub use store::{DiskRunStore, NullRunStore, RunStore};
