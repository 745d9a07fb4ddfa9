#![allow(dead_code)]

use async_trait::async_trait;
use glass_pilot::config::{Budgets, EngineConfig, ExecutorConfig, ResolverConfig};
use glass_pilot::driver::{BrowserDriver, PageInspector};
use glass_pilot::error::{DriverError, PlannerError};
use glass_pilot::gate::{Decision, HumanGate};
use glass_pilot::model::{
    ActionKind, Check, ElementState, InteractiveElement, MicroPlan, PageSnapshot, PlanStep, TestCriterion,
};
use glass_pilot::planner::Planner;
use glass_pilot::selector::Descriptor;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ========================= Fake page =========================

#[derive(Clone, Debug)]
pub struct FakeElement {
    pub tag: String,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub visible: bool,
    pub enabled: bool,
    pub value: Option<String>,
    /// Screen shown after a click or a submit key on this element.
    pub leads_to: Option<Box<Screen>>,
}

impl FakeElement {
    pub fn new(tag: &str, text: &str, attrs: &[(&str, &str)]) -> Self {
        Self {
            tag: tag.into(),
            text: text.into(),
            attributes: attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            visible: true,
            enabled: true,
            value: matches!(tag, "input" | "textarea" | "select").then(String::new),
            leads_to: None,
        }
    }

    pub fn leads_to(mut self, screen: Screen) -> Self {
        self.leads_to = Some(Box::new(screen));
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn interactive(&self) -> InteractiveElement {
        InteractiveElement::new(self.tag.clone(), self.text.clone(), self.attributes.clone(), self.visible, self.enabled)
    }

    /// Answers a descriptor the way the in-page query does: attribute or
    /// role selectors, then a case-insensitive text filter. Css hints match
    /// the element's `data-css` alias.
    fn matches(&self, d: &Descriptor) -> bool {
        let attr = |k: &str| self.attributes.get(k).map(String::as_str);
        let (selected, text) = match d {
            Descriptor::TestId { attribute, value } => (attr(attribute.as_str()) == Some(value.as_str()), None),
            Descriptor::AriaLabel { label } => (attr("aria-label") == Some(label.as_str()), None),
            Descriptor::Id { id } => (attr("id") == Some(id.as_str()), None),
            Descriptor::Name { name } => (attr("name") == Some(name.as_str()), None),
            Descriptor::Class { tag, class, text } => {
                let has_class = attr("class").is_some_and(|c| c.split_whitespace().any(|c| c == class.as_str()));
                (self.tag == *tag && has_class, text.as_deref())
            }
            Descriptor::Role { role, text } => (self.interactive().role == *role, text.as_deref()),
            Descriptor::Css { selector } => (attr("data-css") == Some(selector.as_str()), None),
        };
        selected && text.map_or(true, |t| self.visible_text().to_lowercase().contains(&t.to_lowercase()))
    }

    fn visible_text(&self) -> String {
        [Some(self.text.as_str()), self.value.as_deref(), self.attributes.get("aria-label").map(String::as_str)]
            .into_iter()
            .flatten()
            .find(|t| !t.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    fn state(&self) -> ElementState {
        let el = self.interactive();
        ElementState {
            tag: el.tag,
            role: el.role,
            text: self.text.clone(),
            visible: self.visible,
            enabled: self.enabled,
            value: self.value.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Screen {
    pub url: String,
    pub title: String,
    pub text: String,
    pub elements: Vec<FakeElement>,
}

impl Screen {
    pub fn new(url: &str, title: &str, text: &str, elements: Vec<FakeElement>) -> Self {
        Self { url: url.into(), title: title.into(), text: text.into(), elements }
    }
}

#[derive(Default)]
struct PageData {
    screen: Screen,
    queries: Vec<Descriptor>,
    actions: Vec<String>,
    drift: Vec<(usize, String)>,
    snapshots: usize,
    stale_actions: bool,
    action_delay: Option<Duration>,
}

/// In-memory page: elements answer to their own selector chain and clicks
/// swap in the next screen.
#[derive(Default)]
pub struct FakePage {
    state: Mutex<PageData>,
}

impl FakePage {
    pub fn new(screen: Screen) -> Self {
        Self { state: Mutex::new(PageData { screen, ..Default::default() }) }
    }

    pub fn show(&self, screen: Screen) {
        self.state.lock().unwrap().screen = screen;
    }

    /// Removes `attr` from element `index` right after the next snapshot.
    pub fn drift(&self, index: usize, attr: &str) {
        self.state.lock().unwrap().drift.push((index, attr.to_string()));
    }

    /// Element actions fail as if the target detached after it was resolved.
    pub fn stale_actions(&self) {
        self.state.lock().unwrap().stale_actions = true;
    }

    /// Element actions hang for `delay` before doing anything.
    pub fn slow_actions(&self, delay: Duration) {
        self.state.lock().unwrap().action_delay = Some(delay);
    }

    pub fn queries(&self) -> Vec<Descriptor> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn clear_queries(&self) {
        self.state.lock().unwrap().queries.clear();
    }

    pub fn actions(&self) -> Vec<String> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn snapshots(&self) -> usize {
        self.state.lock().unwrap().snapshots
    }

    pub fn url(&self) -> String {
        self.state.lock().unwrap().screen.url.clone()
    }

    async fn with_target<T>(
        &self,
        target: &Descriptor,
        f: impl FnOnce(&mut PageData, usize) -> T,
    ) -> Result<T, DriverError> {
        let delay = self.state.lock().unwrap().action_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.state.lock().unwrap();
        if st.stale_actions {
            return Err(DriverError::Stale(target.to_string()));
        }
        let idx = st
            .screen
            .elements
            .iter()
            .position(|e| e.matches(target))
            .ok_or_else(|| DriverError::Stale(target.to_string()))?;
        Ok(f(&mut st, idx))
    }

    fn activate(st: &mut PageData, idx: usize) {
        if let Some(next) = st.screen.elements[idx].leads_to.clone() {
            st.screen = *next;
        }
    }
}

#[async_trait]
impl BrowserDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let mut st = self.state.lock().unwrap();
        st.actions.push(format!("navigate {}", url));
        st.screen.url = url.to_string();
        Ok(())
    }

    async fn query(&self, descriptor: &Descriptor) -> Result<Option<ElementState>, DriverError> {
        let mut st = self.state.lock().unwrap();
        st.queries.push(descriptor.clone());
        Ok(st.screen.elements.iter().find(|e| e.matches(descriptor)).map(FakeElement::state))
    }

    async fn click(&self, target: &Descriptor) -> Result<(), DriverError> {
        self.with_target(target, |st, idx| {
            st.actions.push(format!("click {}", target));
            Self::activate(st, idx);
        })
        .await
    }

    async fn set_text(&self, target: &Descriptor, value: &str) -> Result<(), DriverError> {
        self.with_target(target, |st, idx| {
            st.actions.push(format!("type {} {}", target, value));
            st.screen.elements[idx].value = Some(value.to_string());
        })
        .await
    }

    async fn choose_option(&self, target: &Descriptor, value: &str) -> Result<(), DriverError> {
        self.with_target(target, |st, idx| {
            st.actions.push(format!("choose {} {}", target, value));
            st.screen.elements[idx].value = Some(value.to_string());
        })
        .await
    }

    async fn press_key(&self, target: &Descriptor, key: &str) -> Result<(), DriverError> {
        self.with_target(target, |st, idx| {
            st.actions.push(format!("key {} {}", target, key));
            if key == "Enter" {
                Self::activate(st, idx);
            }
        })
        .await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.state.lock().unwrap().screen.url.clone())
    }

    async fn title(&self) -> Result<String, DriverError> {
        Ok(self.state.lock().unwrap().screen.title.clone())
    }

    async fn read_visible_text(&self, target: Option<&Descriptor>) -> Result<String, DriverError> {
        let st = self.state.lock().unwrap();
        match target {
            Some(d) => Ok(st.screen.elements.iter().find(|e| e.matches(d)).map(|e| e.text.clone()).unwrap_or_default()),
            None => Ok(st.screen.text.clone()),
        }
    }

    async fn screenshot_b64(&self) -> Result<Option<String>, DriverError> {
        // PNG signature
        Ok(Some("iVBORw0KGgo=".to_string()))
    }
}

pub struct FakeInspector;

#[async_trait]
impl PageInspector<FakePage> for FakeInspector {
    async fn snapshot(&self, session: &FakePage) -> Result<PageSnapshot, DriverError> {
        let mut st = session.state.lock().unwrap();
        st.snapshots += 1;
        let snapshot = PageSnapshot {
            id: format!("snap-{}", st.snapshots),
            url: st.screen.url.clone(),
            title: st.screen.title.clone(),
            elements: st.screen.elements.iter().map(FakeElement::interactive).collect(),
            captured_at_ms: 0,
        };
        for (idx, attr) in std::mem::take(&mut st.drift) {
            if let Some(el) = st.screen.elements.get_mut(idx) {
                el.attributes.remove(&attr);
            }
        }
        Ok(snapshot)
    }
}

// ========================= Scripted planner =========================

type GoalFn = Box<dyn Fn(&PageSnapshot) -> bool + Send + Sync>;

#[derive(Default)]
pub struct PlannerLog {
    /// "goal", "propose", "revise" and "diagnose", in call order.
    pub calls: Vec<&'static str>,
    pub histories: Vec<Vec<String>>,
    pub feedback: Vec<String>,
}

struct PlannerInner {
    plans: Mutex<VecDeque<MicroPlan>>,
    repeat: Option<MicroPlan>,
    revisions: Mutex<VecDeque<MicroPlan>>,
    goal: GoalFn,
    unavailable: bool,
    log: Mutex<PlannerLog>,
}

/// Planner that hands out queued plans; clones share state.
#[derive(Clone)]
pub struct ScriptedPlanner {
    inner: Arc<PlannerInner>,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<MicroPlan>, goal: impl Fn(&PageSnapshot) -> bool + Send + Sync + 'static) -> Self {
        Self::build(plans, None, Vec::new(), Box::new(goal), false)
    }

    /// Proposes `plan` forever.
    pub fn repeating(plan: MicroPlan, goal: impl Fn(&PageSnapshot) -> bool + Send + Sync + 'static) -> Self {
        Self::build(Vec::new(), Some(plan), Vec::new(), Box::new(goal), false)
    }

    pub fn with_revisions(plans: Vec<MicroPlan>, revisions: Vec<MicroPlan>) -> Self {
        Self::build(plans, None, revisions, Box::new(|_: &PageSnapshot| false), false)
    }

    pub fn unavailable() -> Self {
        Self::build(Vec::new(), None, Vec::new(), Box::new(|_: &PageSnapshot| false), true)
    }

    fn build(
        plans: Vec<MicroPlan>,
        repeat: Option<MicroPlan>,
        revisions: Vec<MicroPlan>,
        goal: GoalFn,
        unavailable: bool,
    ) -> Self {
        Self {
            inner: Arc::new(PlannerInner {
                plans: Mutex::new(plans.into()),
                repeat,
                revisions: Mutex::new(revisions.into()),
                goal,
                unavailable,
                log: Mutex::new(PlannerLog::default()),
            }),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.log.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn histories(&self) -> Vec<Vec<String>> {
        self.inner.log.lock().unwrap().histories.clone()
    }

    pub fn feedback(&self) -> Vec<String> {
        self.inner.log.lock().unwrap().feedback.clone()
    }

    fn record(&self, call: &'static str) {
        self.inner.log.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn propose_micro_plan(
        &self,
        _goal: &str,
        _snapshot: &PageSnapshot,
        history: &[String],
    ) -> Result<MicroPlan, PlannerError> {
        self.record("propose");
        if self.inner.unavailable {
            return Err(PlannerError::Transport("connection refused".into()));
        }
        self.inner.log.lock().unwrap().histories.push(history.to_vec());
        let next = self.inner.plans.lock().unwrap().pop_front();
        next.or_else(|| self.inner.repeat.clone())
            .ok_or_else(|| PlannerError::Decode("script exhausted".into()))
    }

    async fn is_goal_fulfilled(&self, _goal: &str, page: &PageSnapshot) -> Result<bool, PlannerError> {
        self.record("goal");
        Ok((self.inner.goal)(page))
    }

    async fn revise_micro_plan(&self, plan: &MicroPlan, feedback: &str) -> Result<MicroPlan, PlannerError> {
        self.record("revise");
        self.inner.log.lock().unwrap().feedback.push(feedback.to_string());
        let next = self.inner.revisions.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| plan.clone()))
    }
}

// ========================= Scripted gate =========================

#[derive(Clone, Default)]
pub struct ScriptedGate {
    decisions: Arc<Mutex<VecDeque<Decision>>>,
    presented: Arc<Mutex<Vec<MicroPlan>>>,
}

impl ScriptedGate {
    /// Plays `decisions` in order, then approves.
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self { decisions: Arc::new(Mutex::new(decisions.into())), presented: Arc::default() }
    }

    pub fn presented(&self) -> Vec<MicroPlan> {
        self.presented.lock().unwrap().clone()
    }
}

#[async_trait]
impl HumanGate for ScriptedGate {
    async fn present(&self, plan: &MicroPlan) -> Decision {
        self.presented.lock().unwrap().push(plan.clone());
        self.decisions.lock().unwrap().pop_front().unwrap_or(Decision::Approve)
    }
}

// ========================= Builders =========================

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        budgets: Budgets::default(),
        resolver: ResolverConfig { primary_timeout_ms: 120, fallback_timeout_ms: 40, poll_interval_ms: 10 },
        executor: ExecutorConfig {
            action_timeout_ms: 500,
            settle_timeout_ms: 20,
            verify_timeout_ms: 120,
            poll_interval_ms: 10,
            page_state_timeout_ms: 200,
        },
        workflow_max_steps: 50,
    }
}

pub fn step_on(element: usize, description: &str, action: Option<ActionKind>, check: Check) -> PlanStep {
    PlanStep {
        description: description.into(),
        purpose: description.into(),
        action,
        element: Some(element),
        selector_hint: None,
        value: None,
        test_criterion: TestCriterion::new(format!("after: {}", description), check),
    }
}

pub fn await_step(description: &str, check: Check) -> PlanStep {
    PlanStep {
        description: description.into(),
        purpose: description.into(),
        action: Some(ActionKind::Await),
        element: None,
        selector_hint: None,
        value: None,
        test_criterion: TestCriterion::new(format!("after: {}", description), check),
    }
}

pub fn plan(steps: Vec<PlanStep>) -> MicroPlan {
    MicroPlan { steps, estimated_seconds: 5, rationale: Some("scripted".into()) }
}

pub const HOME_URL: &str = "https://jobs.example.com/";
pub const JOBS_URL: &str = "https://jobs.example.com/jobs";

/// Search page reached from the home page's "Jobs" link.
pub fn jobs_screen() -> Screen {
    Screen::new(
        JOBS_URL,
        "Jobs | Example",
        "Search jobs",
        vec![
            FakeElement::new("input", "", &[("type", "search"), ("name", "q"), ("placeholder", "Keywords")]),
            FakeElement::new("button", "Search", &[("type", "submit"), ("data-testid", "search-submit")]),
        ],
    )
}

/// Home page with a labelled "Jobs" link.
pub fn home_screen() -> Screen {
    Screen::new(
        HOME_URL,
        "Example",
        "Welcome",
        vec![
            FakeElement::new("a", "Jobs", &[("href", "/jobs"), ("aria-label", "Jobs"), ("class", "nav-link")])
                .leads_to(jobs_screen()),
            FakeElement::new("a", "About", &[("href", "/about")]),
        ],
    )
}

/// Scenario A plan: open jobs, wait for load, verify the search form.
pub fn open_jobs_plan() -> MicroPlan {
    plan(vec![
        step_on(0, "Click the Jobs link", Some(ActionKind::Click), Check::UrlChanged),
        await_step("Wait for the jobs page to load", Check::TitleContains { text: "Jobs".into() }),
        await_step(
            "Verify the search form is visible",
            Check::ElementVisible { target: Descriptor::Name { name: "q".into() } },
        ),
    ])
}
