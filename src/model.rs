use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{MAX_PLAN_STEPS, MIN_PLAN_STEPS};
use crate::error::{Budget, PlanError, StepErrorKind};
use crate::selector::{Descriptor, SelectorChain};

// ========================= Page =========================

/// Structured view of the page for one planning cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub id: String,
    pub url: String,
    pub title: String,
    pub elements: Vec<InteractiveElement>,
    pub captured_at_ms: u128,
}

impl PageSnapshot {
    pub fn state(&self) -> PageState {
        PageState { url: self.url.clone(), title: self.title.clone() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub tag: String,
    pub role: String,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub visible: bool,
    pub enabled: bool,
    pub selector: SelectorChain,
}

impl InteractiveElement {
    /// Normalises the role and derives the element's selector chain.
    pub fn new(
        tag: impl Into<String>,
        text: impl Into<String>,
        attributes: BTreeMap<String, String>,
        visible: bool,
        enabled: bool,
    ) -> Self {
        let tag = tag.into().to_lowercase();
        let text = text.into();
        let role = normalize_role(&tag, &attributes);
        let selector = SelectorChain::for_element(&tag, &role, &text, &attributes);
        Self { tag, role, text, attributes, visible, enabled, selector }
    }

    /// One-line rendering used in planner prompts.
    pub fn describe(&self) -> String {
        let mut s = format!("{} \"{}\"", self.role, self.text.trim());
        for key in ["placeholder", "aria-label", "name", "type", "href"] {
            if let Some(v) = self.attributes.get(key).filter(|v| !v.is_empty()) {
                s.push_str(&format!(" {}=\"{}\"", key, v));
            }
        }
        if !self.enabled {
            s.push_str(" (disabled)");
        }
        s
    }
}

/// ARIA role of an element: the explicit `role` attribute, else the implicit
/// role of its tag.
pub fn normalize_role(tag: &str, attributes: &BTreeMap<String, String>) -> String {
    if let Some(role) = attributes.get("role").map(|r| r.trim()).filter(|r| !r.is_empty()) {
        return role.to_lowercase();
    }
    let input_type = attributes.get("type").map(|t| t.to_lowercase()).unwrap_or_default();
    match tag {
        "a" => "link",
        "button" => "button",
        "select" => "combobox",
        "textarea" => "textbox",
        "option" => "option",
        "input" => match input_type.as_str() {
            "submit" | "button" | "reset" | "image" => "button",
            "checkbox" => "checkbox",
            "radio" => "radio",
            "search" => "searchbox",
            "range" => "slider",
            "number" => "spinbutton",
            _ => "textbox",
        },
        other => return other.to_string(),
    }
    .to_string()
}

/// Url and title, captured before and after every action.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
}

/// What the driver observed for one element match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementState {
    pub tag: String,
    pub role: String,
    pub text: String,
    pub visible: bool,
    pub enabled: bool,
    pub value: Option<String>,
}

// ========================= Plans =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    FillText,
    ChooseOption,
    SubmitKey,
    Navigate,
    /// No interaction; the step succeeds only if its criterion holds.
    Await,
}

impl ActionKind {
    pub fn needs_target(&self) -> bool {
        !matches!(self, ActionKind::Navigate | ActionKind::Await)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    UrlChanged,
    UrlContains { fragment: String },
    TitleContains { text: String },
    TextVisible { text: String },
    ElementVisible { target: Descriptor },
    /// Value of the acted-on element.
    InputValue { expected: String },
}

impl Check {
    fn has_operands(&self) -> bool {
        match self {
            Check::UrlChanged => true,
            Check::UrlContains { fragment } => !fragment.trim().is_empty(),
            Check::TitleContains { text } | Check::TextVisible { text } => !text.trim().is_empty(),
            Check::ElementVisible { target } => !target.is_blank(),
            Check::InputValue { .. } => true,
        }
    }
}

/// Observable success condition of a plan step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestCriterion {
    pub description: String,
    pub check: Check,
}

impl TestCriterion {
    pub fn new(description: impl Into<String>, check: Check) -> Self {
        Self { description: description.into(), check }
    }

    pub fn is_usable(&self) -> bool {
        !self.description.trim().is_empty() && self.check.has_operands()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    /// What the target is for, e.g. "search box" or "submit application".
    pub purpose: String,
    #[serde(default)]
    pub action: Option<ActionKind>,
    /// Index into the snapshot the plan was made from.
    #[serde(default)]
    pub element: Option<usize>,
    #[serde(default)]
    pub selector_hint: Option<Descriptor>,
    /// Text to type, option to choose, key to press or url to open.
    #[serde(default)]
    pub value: Option<String>,
    pub test_criterion: TestCriterion,
}

impl PlanStep {
    /// Selector chain for this step's target against `snapshot`.
    ///
    /// A snapshot element supplies its chain; a hint alone becomes the
    /// primary, a hint next to an element becomes the last fallback.
    pub fn target_chain(&self, snapshot: &PageSnapshot) -> Option<SelectorChain> {
        let from_element = self
            .element
            .and_then(|i| snapshot.elements.get(i))
            .map(|e| e.selector.clone());
        match (from_element, self.selector_hint.clone()) {
            (Some(chain), Some(hint)) => Some(chain.with_fallback(hint)),
            (Some(chain), None) => Some(chain),
            (None, Some(hint)) if !hint.is_blank() => Some(SelectorChain::new(hint, Vec::new())),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MicroPlan {
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub estimated_seconds: u64,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl MicroPlan {
    /// Rejects plans outside the size bounds or with unusable steps.
    pub fn validate(&self) -> Result<(), PlanError> {
        let got = self.steps.len();
        if !(MIN_PLAN_STEPS..=MAX_PLAN_STEPS).contains(&got) {
            return Err(PlanError::Size { got, min: MIN_PLAN_STEPS, max: MAX_PLAN_STEPS });
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.description.trim().is_empty() {
                return Err(PlanError::EmptyDescription { index });
            }
            if !step.test_criterion.is_usable() {
                return Err(PlanError::MissingCriterion { index });
            }
        }
        Ok(())
    }
}

// ========================= Execution =========================

/// Terminal event of one executed step; doubles as the workflow transition tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    /// An action was performed and its criterion held.
    Performed,
    /// No action was required and the criterion held.
    Observed,
    Failed(StepErrorKind),
}

impl StepEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            StepEvent::Performed | StepEvent::Observed => "success",
            StepEvent::Failed(kind) => kind.as_str(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub event: StepEvent,
    pub error: Option<StepErrorKind>,
    pub message: Option<String>,
    pub action: Option<ActionKind>,
    pub target: Option<Descriptor>,
    /// Always populated, including on failure.
    pub page: PageState,
}

// ========================= Run =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommittedStep {
    pub index: usize,
    pub plan: u32,
    pub description: String,
    pub purpose: String,
    pub action: ActionKind,
    pub target: Option<Descriptor>,
    pub chain: Option<SelectorChain>,
    pub value: Option<String>,
    pub test_criterion: TestCriterion,
    pub event: StepEvent,
    pub url_after: String,
}

impl CommittedStep {
    /// Plan step that performs this committed action again.
    pub fn to_plan_step(&self) -> PlanStep {
        let hint = self.chain.is_none().then(|| self.target.clone()).flatten();
        PlanStep {
            description: self.description.clone(),
            purpose: self.purpose.clone(),
            action: Some(self.action),
            element: None,
            selector_hint: hint,
            value: self.value.clone(),
            test_criterion: self.test_criterion.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub plan: u32,
    /// Position in the micro-plan, `None` for plan-level rejections.
    pub step: Option<usize>,
    pub description: String,
    pub kind: Option<StepErrorKind>,
    pub message: String,
    pub url: String,
    pub diagnosis: Option<String>,
}

/// Checkpointed state of one automation run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BotRunContext {
    pub run_id: String,
    pub goal: String,
    pub target_url: String,
    pub history: Vec<CommittedStep>,
    pub failures: Vec<FailureRecord>,
    pub plans_issued: u32,
    pub steps_committed: u32,
}

impl BotRunContext {
    pub fn new(run_id: impl Into<String>, goal: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            goal: goal.into(),
            target_url: target_url.into(),
            history: Vec::new(),
            failures: Vec::new(),
            plans_issued: 0,
            steps_committed: 0,
        }
    }

    /// Descriptions of committed steps, the only history planners see.
    pub fn history_descriptions(&self) -> Vec<String> {
        self.history.iter().map(|s| s.description.clone()).collect()
    }

    pub fn last_failure(&self) -> Option<&FailureRecord> {
        self.failures.last()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Aborted,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    GoalFulfilled,
    UserCancelled,
    BudgetExceeded(Budget),
    PlannerUnavailable(String),
    Configuration(String),
    Driver(String),
    Persistence(String),
}

impl TerminationReason {
    pub fn status(&self) -> RunStatus {
        match self {
            TerminationReason::GoalFulfilled => RunStatus::Done,
            TerminationReason::UserCancelled | TerminationReason::BudgetExceeded(_) => RunStatus::Aborted,
            _ => RunStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(desc: &str) -> PlanStep {
        PlanStep {
            description: desc.into(),
            purpose: "link".into(),
            action: Some(ActionKind::Click),
            element: Some(0),
            selector_hint: None,
            value: None,
            test_criterion: TestCriterion::new("url changes", Check::UrlChanged),
        }
    }

    #[test]
    fn plan_size_bounds_are_enforced() {
        for n in [0, 1, 2, 6, 9] {
            let plan = MicroPlan { steps: (0..n).map(|_| step("go")).collect(), estimated_seconds: 5, rationale: None };
            assert!(matches!(plan.validate(), Err(PlanError::Size { got, .. }) if got == n));
        }
        for n in 3..=5 {
            let plan = MicroPlan { steps: (0..n).map(|_| step("go")).collect(), estimated_seconds: 5, rationale: None };
            assert!(plan.validate().is_ok());
        }
    }

    #[test]
    fn blank_criterion_is_rejected() {
        let mut bad = step("type query");
        bad.test_criterion = TestCriterion::new("  ", Check::UrlChanged);
        let plan = MicroPlan { steps: vec![step("a"), bad, step("c")], estimated_seconds: 0, rationale: None };
        assert_eq!(plan.validate(), Err(PlanError::MissingCriterion { index: 1 }));

        let mut empty_operand = step("b");
        empty_operand.test_criterion = TestCriterion::new("title", Check::TitleContains { text: "".into() });
        let plan = MicroPlan { steps: vec![step("a"), step("b"), empty_operand], estimated_seconds: 0, rationale: None };
        assert_eq!(plan.validate(), Err(PlanError::MissingCriterion { index: 2 }));
    }

    #[test]
    fn roles_follow_tag_and_type() {
        let mut attrs = BTreeMap::new();
        assert_eq!(normalize_role("a", &attrs), "link");
        attrs.insert("type".to_string(), "submit".to_string());
        assert_eq!(normalize_role("input", &attrs), "button");
        attrs.insert("role".to_string(), "Tab".to_string());
        assert_eq!(normalize_role("div", &attrs), "tab");
    }

    #[test]
    fn hint_joins_element_chain_as_last_fallback() {
        let mut attrs = BTreeMap::new();
        attrs.insert("id".to_string(), "jobs".to_string());
        let snapshot = PageSnapshot {
            id: "s".into(),
            url: "https://example.com".into(),
            title: "Home".into(),
            elements: vec![InteractiveElement::new("a", "Jobs", attrs, true, true)],
            captured_at_ms: 0,
        };
        let mut s = step("open jobs");
        s.selector_hint = Some(Descriptor::Css { selector: "nav a.jobs".into() });
        let chain = s.target_chain(&snapshot).unwrap();
        assert_eq!(chain.primary, Descriptor::Id { id: "jobs".into() });
        assert_eq!(chain.fallbacks.last(), Some(&Descriptor::Css { selector: "nav a.jobs".into() }));

        s.element = Some(7);
        let chain = s.target_chain(&snapshot).unwrap();
        assert_eq!(chain.primary, Descriptor::Css { selector: "nav a.jobs".into() });

        s.selector_hint = None;
        assert!(s.target_chain(&snapshot).is_none());
    }
}
