use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PlannerError;
use crate::model::{FailureRecord, MicroPlan, PageSnapshot};

/// Advisory note about why a step failed. Never binding on the controller.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiagnosisHint {
    pub summary: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Oracle that proposes micro-plans and judges goal completion.
#[async_trait]
pub trait Planner: Send + Sync {
    /// `history` holds descriptions of committed steps only.
    async fn propose_micro_plan(
        &self,
        goal: &str,
        snapshot: &PageSnapshot,
        history: &[String],
    ) -> Result<MicroPlan, PlannerError>;

    async fn is_goal_fulfilled(&self, goal: &str, page: &PageSnapshot) -> Result<bool, PlannerError>;

    async fn revise_micro_plan(&self, plan: &MicroPlan, feedback: &str) -> Result<MicroPlan, PlannerError>;

    async fn diagnose(&self, failure: &FailureRecord) -> Result<DiagnosisHint, PlannerError> {
        Ok(DiagnosisHint { summary: failure.message.clone(), suggestion: None })
    }
}
