use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::driver::BrowserDriver;
use crate::error::{DriverError, StepError};
use crate::model::{
    ActionKind, Check, ElementState, ExecutionResult, PageState, PlanStep, StepEvent,
};
use crate::selector::{Descriptor, ResolvedTarget, SelectorChain, SelectorResolver};

const TEXT_ENTRY_ROLES: &[&str] = &["textbox", "searchbox", "spinbutton", "combobox"];
const CLICKABLE_ROLES: &[&str] = &[
    "button", "link", "checkbox", "radio", "menuitem", "tab", "option", "switch", "summary",
];
const SUBMIT_WORDS: &[&str] = &["submit", "search", "enter", "send", "confirm"];

fn is_text_entry(state: &ElementState) -> bool {
    state.tag != "select" && TEXT_ENTRY_ROLES.contains(&state.role.as_str())
}

fn is_choice(state: &ElementState) -> bool {
    state.tag == "select" || state.role == "listbox"
}

// ========================= Action intent =========================

/// Decides the action kind once, from the target's role and the step's
/// declared action or purpose.
pub fn resolve_action(target: Option<&ElementState>, step: &PlanStep) -> Result<ActionKind, StepError> {
    if let Some(kind) = step.action {
        if !kind.needs_target() {
            return Ok(kind);
        }
        let state = target.ok_or_else(|| StepError::NotFound(format!("{:?} needs a target", kind)))?;
        let compatible = match kind {
            ActionKind::Click => true,
            ActionKind::FillText => is_text_entry(state),
            ActionKind::ChooseOption => is_choice(state),
            ActionKind::SubmitKey => {
                is_text_entry(state) || matches!(state.role.as_str(), "button" | "link")
            }
            ActionKind::Navigate | ActionKind::Await => true,
        };
        return if compatible {
            Ok(kind)
        } else {
            Err(StepError::ActionIndeterminate(format!(
                "{:?} does not apply to a {} <{}>",
                kind, state.role, state.tag
            )))
        };
    }

    let state = target.ok_or_else(|| {
        StepError::ActionIndeterminate("no action kind and no target".to_string())
    })?;
    let purpose = step.purpose.to_lowercase();
    let has_value = step.value.as_deref().is_some_and(|v| !v.is_empty());

    if has_value && is_choice(state) {
        return Ok(ActionKind::ChooseOption);
    }
    if has_value && is_text_entry(state) {
        return Ok(ActionKind::FillText);
    }
    if !has_value && is_text_entry(state) && SUBMIT_WORDS.iter().any(|w| purpose.contains(w)) {
        return Ok(ActionKind::SubmitKey);
    }
    if CLICKABLE_ROLES.contains(&state.role.as_str()) {
        return Ok(ActionKind::Click);
    }
    Err(StepError::ActionIndeterminate(format!(
        "cannot act on a {} <{}> for purpose '{}'",
        state.role, state.tag, step.purpose
    )))
}

// ========================= Executor =========================

pub struct StepExecutor<'a, D: BrowserDriver + ?Sized> {
    driver: &'a D,
    cfg: ExecutorConfig,
}

impl<'a, D: BrowserDriver + ?Sized> StepExecutor<'a, D> {
    pub fn new(driver: &'a D, cfg: ExecutorConfig) -> Self {
        Self { driver, cfg }
    }

    /// Resolves the step's target (when its action needs one) and executes it.
    pub async fn run_step(
        &self,
        resolver: &SelectorResolver<'_, D>,
        step: &PlanStep,
        chain: Option<&SelectorChain>,
        before: &PageState,
    ) -> ExecutionResult {
        let needs_target = step.action.map(|a| a.needs_target()).unwrap_or(true);
        if !needs_target {
            return self.execute(None, step, before).await;
        }
        let Some(chain) = chain else {
            let err = StepError::NotFound("step names no element and no selector hint".to_string());
            return self.failure(err, step.action, None, before).await;
        };
        match resolver.resolve_default(chain).await {
            Ok(target) => self.execute(Some(&target), step, before).await,
            Err(err) => self.failure(err, step.action, None, before).await,
        }
    }

    /// Performs the step's action on `target`, waits for the page to settle
    /// and checks the step's test criterion.
    ///
    /// Success is reported only when the criterion was evaluated and held.
    pub async fn execute(
        &self,
        target: Option<&ResolvedTarget>,
        step: &PlanStep,
        before: &PageState,
    ) -> ExecutionResult {
        let kind = match resolve_action(target.map(|t| &t.state), step) {
            Ok(kind) => kind,
            Err(err) => {
                let descriptor = target.map(|t| t.descriptor.clone());
                return self.failure(err, step.action, descriptor, before).await;
            }
        };
        let descriptor = target.map(|t| t.descriptor.clone());
        info!(
            action = ?kind,
            selector = ?descriptor.as_ref().map(|d| d.to_string()),
            "executing step: {}",
            step.description
        );

        if let Err(err) = self.perform(kind, descriptor.as_ref(), step).await {
            return self.failure(err, Some(kind), descriptor, before).await;
        }

        match timeout(self.cfg.settle_timeout(), self.driver.wait_for_settle()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("settle wait failed: {}", e),
            Err(_) => debug!(bound_ms = self.cfg.settle_timeout_ms, "page did not settle within bound"),
        }

        if let Err(err) = self.verify(step, descriptor.as_ref(), before).await {
            return self.failure(err, Some(kind), descriptor, before).await;
        }

        let page = self.page_state_or(before).await;
        let event = if kind == ActionKind::Await { StepEvent::Observed } else { StepEvent::Performed };
        info!(event = %event.tag(), url = %page.url, "step verified");
        ExecutionResult {
            success: true,
            event,
            error: None,
            message: Some(step.test_criterion.description.clone()),
            action: Some(kind),
            target: descriptor,
            page,
        }
    }

    async fn perform(
        &self,
        kind: ActionKind,
        target: Option<&Descriptor>,
        step: &PlanStep,
    ) -> Result<(), StepError> {
        match timeout(self.cfg.action_timeout(), self.dispatch(kind, target, step)).await {
            Ok(result) => result,
            Err(_) => Err(StepError::ActionFailed(format!(
                "{:?} did not complete within {}ms",
                kind, self.cfg.action_timeout_ms
            ))),
        }
    }

    async fn dispatch(
        &self,
        kind: ActionKind,
        target: Option<&Descriptor>,
        step: &PlanStep,
    ) -> Result<(), StepError> {
        let value = step.value.as_deref().filter(|v| !v.is_empty());
        let need_value = |what: &str| {
            value.ok_or_else(|| StepError::ActionIndeterminate(format!("{:?} needs a {}", kind, what)))
        };
        let need_target = || {
            target.ok_or_else(|| StepError::NotFound(format!("{:?} needs a target", kind)))
        };

        let outcome = match kind {
            ActionKind::Click => self.driver.click(need_target()?).await,
            ActionKind::FillText => {
                let text = need_value("text")?;
                self.driver.set_text(need_target()?, text).await
            }
            ActionKind::ChooseOption => {
                let option = need_value("option")?;
                self.driver.choose_option(need_target()?, option).await
            }
            ActionKind::SubmitKey => self.driver.press_key(need_target()?, value.unwrap_or("Enter")).await,
            ActionKind::Navigate => self.driver.navigate(need_value("url")?).await,
            ActionKind::Await => Ok(()),
        };
        outcome.map_err(action_failed)
    }

    async fn verify(
        &self,
        step: &PlanStep,
        target: Option<&Descriptor>,
        before: &PageState,
    ) -> Result<(), StepError> {
        let check = &step.test_criterion.check;
        if matches!(check, Check::InputValue { .. }) && target.is_none() {
            return Err(StepError::VerificationFailed(
                "input value check has no target element".to_string(),
            ));
        }
        let until = Instant::now() + self.cfg.verify_timeout();
        loop {
            match self.check_holds(check, target, before).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => debug!("criterion probe failed: {}", e),
            }
            let now = Instant::now();
            if now >= until {
                return Err(StepError::VerificationFailed(format!(
                    "'{}' did not hold within {}ms",
                    step.test_criterion.description, self.cfg.verify_timeout_ms
                )));
            }
            sleep(self.cfg.poll_interval().min(until - now)).await;
        }
    }

    async fn check_holds(
        &self,
        check: &Check,
        target: Option<&Descriptor>,
        before: &PageState,
    ) -> Result<bool, DriverError> {
        Ok(match check {
            Check::UrlChanged => self.driver.current_url().await? != before.url,
            Check::UrlContains { fragment } => self.driver.current_url().await?.contains(fragment.as_str()),
            Check::TitleContains { text } => contains_ci(&self.driver.title().await?, text),
            Check::TextVisible { text } => contains_ci(&self.driver.read_visible_text(None).await?, text),
            Check::ElementVisible { target } => {
                self.driver.query(target).await?.is_some_and(|s| s.visible)
            }
            Check::InputValue { expected } => match target {
                Some(t) => self
                    .driver
                    .query(t)
                    .await?
                    .and_then(|s| s.value)
                    .is_some_and(|v| v.trim() == expected.trim()),
                None => false,
            },
        })
    }

    async fn failure(
        &self,
        err: StepError,
        action: Option<ActionKind>,
        target: Option<Descriptor>,
        before: &PageState,
    ) -> ExecutionResult {
        warn!(kind = %err.kind().as_str(), "step failed: {}", err.message());
        ExecutionResult {
            success: false,
            event: StepEvent::Failed(err.kind()),
            error: Some(err.kind()),
            message: Some(err.message().to_string()),
            action,
            target,
            page: self.page_state_or(before).await,
        }
    }

    async fn page_state_or(&self, fallback: &PageState) -> PageState {
        match timeout(self.cfg.page_state_timeout(), self.driver.page_state()).await {
            Ok(Ok(state)) => state,
            _ => fallback.clone(),
        }
    }
}

fn action_failed(e: DriverError) -> StepError {
    StepError::ActionFailed(e.to_string())
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
