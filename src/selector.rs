//! Ranked element descriptors and their resolution against the live page.
//!
//! A [`SelectorChain`] is built once per snapshot element, most durable
//! descriptor first. The [`SelectorResolver`] walks the chain with
//! short-circuit evaluation and never reports a match it could not observe.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::ResolverConfig;
use crate::driver::BrowserDriver;
use crate::error::StepError;
use crate::model::ElementState;

/// Attributes that exist only to give automation a stable handle.
pub const TEST_ATTRIBUTES: &[&str] = &[
    "data-testid",
    "data-test-id",
    "data-test",
    "data-qa",
    "data-cy",
    "data-automation-id",
];

/// Roles whose visible text is their current value, so text cannot identify them.
const VALUE_ROLES: &[&str] = &["textbox", "searchbox", "combobox", "listbox", "spinbutton", "slider"];

/// Roles whose elements must also be enabled to count as a match.
const ACTIONABLE_ROLES: &[&str] = &[
    "button", "textbox", "searchbox", "combobox", "listbox", "checkbox", "radio", "option",
    "menuitem", "switch", "tab", "spinbutton", "slider",
];

pub fn is_actionable_role(role: &str) -> bool {
    ACTIONABLE_ROLES.contains(&role)
}

// ========================= Descriptors =========================

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Descriptor {
    TestId { attribute: String, value: String },
    AriaLabel { label: String },
    Id { id: String },
    Name { name: String },
    /// `text` narrows a shared class to the element carrying that text.
    Class {
        tag: String,
        class: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Role { role: String, text: Option<String> },
    Css { selector: String },
}

impl Descriptor {
    /// Stability estimate of this descriptor kind, 0..=100.
    pub fn score(&self) -> u8 {
        match self {
            Descriptor::TestId { .. } => 95,
            Descriptor::AriaLabel { .. } => 85,
            Descriptor::Id { .. } => 80,
            Descriptor::Name { .. } => 75,
            Descriptor::Class { .. } => 60,
            Descriptor::Css { .. } => 50,
            Descriptor::Role { .. } => 30,
        }
    }

    /// CSS selector plus an optional visible-text filter.
    pub fn query_parts(&self) -> (String, Option<String>) {
        match self {
            Descriptor::TestId { attribute, value } => {
                (format!("[{}=\"{}\"]", attribute, css_escape(value)), None)
            }
            Descriptor::AriaLabel { label } => {
                (format!("[aria-label=\"{}\"]", css_escape(label)), None)
            }
            Descriptor::Id { id } => (format!("[id=\"{}\"]", css_escape(id)), None),
            Descriptor::Name { name } => (format!("[name=\"{}\"]", css_escape(name)), None),
            Descriptor::Class { tag, class, text } => (format!("{}.{}", tag, class), text.clone()),
            Descriptor::Role { role, text } => (role_css(role), text.clone()),
            Descriptor::Css { selector } => (selector.clone(), None),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Descriptor::TestId { value, .. } => value.trim().is_empty(),
            Descriptor::AriaLabel { label } => label.trim().is_empty(),
            Descriptor::Id { id } => id.trim().is_empty(),
            Descriptor::Name { name } => name.trim().is_empty(),
            Descriptor::Class { class, .. } => class.trim().is_empty(),
            Descriptor::Role { role, .. } => role.trim().is_empty(),
            Descriptor::Css { selector } => selector.trim().is_empty(),
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (css, text) = self.query_parts();
        match text {
            Some(t) => write!(f, "{} \"{}\"", css, t),
            None => f.write_str(&css),
        }
    }
}

fn css_escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}

fn role_css(role: &str) -> String {
    let native = match role {
        "link" => "a[href]",
        "button" => "button, input[type=button], input[type=submit]",
        "textbox" => "input:not([type]), input[type=text], input[type=email], input[type=password], textarea",
        "searchbox" => "input[type=search]",
        "combobox" => "select",
        "checkbox" => "input[type=checkbox]",
        "radio" => "input[type=radio]",
        other => return format!("{}, [role=\"{}\"]", other, other),
    };
    format!("{}, [role=\"{}\"]", native, role)
}

// ========================= Generated-name heuristics =========================

static FRAMEWORK_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:ember|react|mui|radix|headlessui|rc|yui|ext|gwt|j_id|ctl)[-_:]?.*\d").unwrap()
});
static TRAILING_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{3,}$").unwrap());
static REACT_USE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:r[0-9a-z]+:$").unwrap());
static HASH_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9a-zA-Z]{6,}").unwrap());
static CSS_MODULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:css|sc|jsx|emotion|svelte)-[0-9a-zA-Z]+$|__[0-9a-zA-Z_-]{5,}$").unwrap()
});

/// Whether an identifier or class name looks machine generated.
pub fn looks_generated(name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return true;
    }
    if FRAMEWORK_ID.is_match(name)
        || TRAILING_DIGITS.is_match(name)
        || REACT_USE_ID.is_match(name)
        || CSS_MODULE.is_match(name)
    {
        return true;
    }
    HASH_RUN.find_iter(name).any(|m| {
        let run = m.as_str();
        let digits = run.chars().filter(|c| c.is_ascii_digit()).count();
        digits >= 2 && digits < run.len()
    })
}

// ========================= Chain =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectorChain {
    pub primary: Descriptor,
    pub fallbacks: Vec<Descriptor>,
    pub stability_score: u8,
    pub require_visible: bool,
    pub require_enabled: bool,
    /// Role of the snapshot element this chain was built for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_role: Option<String>,
    /// Text the matched element must contain, case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_text: Option<String>,
}

impl SelectorChain {
    pub fn new(primary: Descriptor, fallbacks: Vec<Descriptor>) -> Self {
        let stability_score = primary.score();
        Self {
            primary,
            fallbacks,
            stability_score,
            require_visible: true,
            require_enabled: false,
            expected_role: None,
            expected_text: None,
        }
    }

    /// Chain from unordered candidates, most durable first. `None` if empty.
    pub fn ranked(mut candidates: Vec<Descriptor>) -> Option<Self> {
        candidates.retain(|d| !d.is_blank());
        let mut seen = Vec::with_capacity(candidates.len());
        candidates.retain(|d| {
            if seen.contains(d) {
                false
            } else {
                seen.push(d.clone());
                true
            }
        });
        // stable sort keeps caller order among equal scores
        candidates.sort_by(|a, b| b.score().cmp(&a.score()));
        let mut it = candidates.into_iter();
        let primary = it.next()?;
        Some(Self::new(primary, it.collect()))
    }

    /// Builds the chain for one element from its tag, role, text and attributes.
    ///
    /// The bare role descriptor is always present, so the chain is never empty.
    /// The chain remembers the element's role and, unless the role shows a
    /// value, its text; descriptors shared with other elements then cannot
    /// resolve to the wrong one.
    pub fn for_element(
        tag: &str,
        role: &str,
        text: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Self {
        let mut candidates = Vec::new();
        for attr in TEST_ATTRIBUTES {
            if let Some(v) = attributes.get(*attr).filter(|v| !v.trim().is_empty()) {
                candidates.push(Descriptor::TestId { attribute: attr.to_string(), value: v.clone() });
            }
        }
        if let Some(label) = attributes.get("aria-label").filter(|v| !v.trim().is_empty()) {
            candidates.push(Descriptor::AriaLabel { label: label.clone() });
        }
        if let Some(id) = attributes.get("id").filter(|v| !looks_generated(v)) {
            candidates.push(Descriptor::Id { id: id.clone() });
        }
        if let Some(name) = attributes.get("name").filter(|v| !v.trim().is_empty()) {
            candidates.push(Descriptor::Name { name: name.clone() });
        }
        let text = text.trim();
        let label = (!text.is_empty()).then(|| truncate(text, 60));
        let identity = label.clone().filter(|_| !VALUE_ROLES.contains(&role));
        if let Some(class) = attributes
            .get("class")
            .and_then(|c| c.split_whitespace().find(|c| !looks_generated(c) && is_css_ident(c)))
        {
            candidates.push(Descriptor::Class {
                tag: tag.to_lowercase(),
                class: class.to_string(),
                text: identity.clone(),
            });
        }
        candidates.push(Descriptor::Role { role: role.to_string(), text: label });

        let mut chain = match Self::ranked(candidates) {
            Some(chain) => chain,
            None => Self::new(Descriptor::Role { role: role.to_string(), text: None }, Vec::new()),
        };
        chain.require_enabled = is_actionable_role(role);
        chain.expected_role = Some(role.to_string());
        chain.expected_text = identity;
        chain
    }

    /// Appends a descriptor as the last resort, unless already present.
    pub fn with_fallback(mut self, descriptor: Descriptor) -> Self {
        if descriptor.is_blank() || self.primary == descriptor || self.fallbacks.contains(&descriptor) {
            return self;
        }
        self.fallbacks.push(descriptor);
        self
    }

    pub fn len(&self) -> usize {
        1 + self.fallbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }

    /// Whether an observed element satisfies this chain's validation predicates.
    pub fn accepts(&self, state: &ElementState) -> bool {
        if self.require_visible && !state.visible {
            return false;
        }
        let must_be_enabled = self.require_enabled || is_actionable_role(&state.role);
        !(must_be_enabled && !state.enabled)
    }

    /// Whether an observed element is the one this chain was built for.
    pub fn identifies(&self, state: &ElementState) -> bool {
        if self.expected_role.as_ref().is_some_and(|r| *r != state.role) {
            return false;
        }
        match &self.expected_text {
            Some(text) => normalize_text(&state.text).contains(&normalize_text(text)),
            None => true,
        }
    }
}

fn normalize_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn is_css_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ========================= Resolution =========================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedTarget {
    /// Descriptor that matched.
    pub descriptor: Descriptor,
    /// Position of that descriptor in the chain (0 = primary).
    pub rank: usize,
    pub state: ElementState,
}

impl ResolvedTarget {
    pub fn role(&self) -> &str {
        &self.state.role
    }

    pub fn used_fallback(&self) -> bool {
        self.rank > 0
    }
}

pub struct SelectorResolver<'a, D: BrowserDriver + ?Sized> {
    driver: &'a D,
    cfg: ResolverConfig,
}

impl<'a, D: BrowserDriver + ?Sized> SelectorResolver<'a, D> {
    pub fn new(driver: &'a D, cfg: ResolverConfig) -> Self {
        Self { driver, cfg }
    }

    /// Finds the first descriptor whose match is present, visible and, when
    /// the role demands it, enabled. A match that is a different element than
    /// the chain's moves on to the next descriptor at once.
    ///
    /// The primary gets `deadline`; each fallback gets the shorter of
    /// `deadline` and the configured fallback timeout. A primary hit
    /// short-circuits the chain.
    pub async fn resolve(
        &self,
        chain: &SelectorChain,
        deadline: Duration,
    ) -> Result<ResolvedTarget, StepError> {
        let fallback_deadline = deadline.min(self.cfg.fallback_timeout());
        for (rank, descriptor) in chain.descriptors().enumerate() {
            let budget = if rank == 0 { deadline } else { fallback_deadline };
            debug!(
                rank,
                descriptor = %descriptor,
                budget_ms = budget.as_millis() as u64,
                "resolve attempt"
            );
            if let Some(state) = self.attempt(chain, descriptor, budget).await {
                info!(rank, descriptor = %descriptor, "target resolved");
                return Ok(ResolvedTarget { descriptor: descriptor.clone(), rank, state });
            }
        }
        Err(StepError::NotFound(format!(
            "{} descriptor(s) exhausted, primary {}",
            chain.len(),
            chain.primary
        )))
    }

    /// Resolves with the configured primary deadline.
    pub async fn resolve_default(&self, chain: &SelectorChain) -> Result<ResolvedTarget, StepError> {
        self.resolve(chain, self.cfg.primary_timeout()).await
    }

    async fn attempt(
        &self,
        chain: &SelectorChain,
        descriptor: &Descriptor,
        budget: Duration,
    ) -> Option<ElementState> {
        let until = Instant::now() + budget;
        loop {
            match self.driver.query(descriptor).await {
                Ok(Some(state)) if !chain.identifies(&state) => {
                    debug!(
                        descriptor = %descriptor,
                        role = %state.role,
                        text = %state.text,
                        "descriptor matches a different element"
                    );
                    return None;
                }
                Ok(Some(state)) if chain.accepts(&state) => return Some(state),
                Ok(Some(state)) => {
                    debug!(
                        descriptor = %descriptor,
                        visible = state.visible,
                        enabled = state.enabled,
                        "match rejected by predicates"
                    )
                }
                Ok(None) => {}
                Err(e) => debug!(descriptor = %descriptor, "query error: {}", e),
            }
            let now = Instant::now();
            if now >= until {
                return None;
            }
            sleep(self.cfg.poll_interval().min(until - now)).await;
        }
    }
}
