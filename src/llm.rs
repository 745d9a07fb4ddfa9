use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use tracing::debug;

use crate::config::{MAX_PLAN_STEPS, MIN_PLAN_STEPS};
use crate::error::PlannerError;
use crate::model::{FailureRecord, MicroPlan, PageSnapshot};
use crate::planner::{DiagnosisHint, Planner};

/// Elements beyond this index are left out of prompts.
const MAX_PROMPT_ELEMENTS: usize = 150;

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_base: String,   // e.g. "https://api.deepseek.com/v1"
    pub api_key: String,    // env PLANNER_API_KEY, then DEEPSEEK_API_KEY
    pub model: String,      // e.g. "deepseek-chat"
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("PLANNER_API_BASE").unwrap_or_else(|_| "https://api.deepseek.com/v1".into()),
            api_key: env::var("PLANNER_API_KEY")
                .or_else(|_| env::var("DEEPSEEK_API_KEY"))
                .unwrap_or_default(),
            model: env::var("PLANNER_MODEL").unwrap_or_else(|_| "deepseek-chat".into()),
            temperature: 0.7,
            max_tokens: 800,
        }
    }
}

/// Planner backed by an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct LlmPlanner {
    http: Client,
    cfg: LlmConfig,
}

#[derive(Debug, Deserialize)]
struct GoalVerdict {
    fulfilled: bool,
    #[serde(default)]
    reason: String,
}

impl LlmPlanner {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("PLANNER_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let req = json!({
            "model": self.cfg.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "temperature": self.cfg.temperature,
            "max_tokens": self.cfg.max_tokens,
            "stream": false
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("planner error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse chat completion JSON")?;
        message_content(&v)
    }

    /// Sends the prompt and decodes the JSON object in the reply.
    async fn ask<T: for<'de> Deserialize<'de>>(&self, system: &str, user: &str) -> Result<T, PlannerError> {
        let reply = self
            .chat(system, user)
            .await
            .map_err(|e| PlannerError::Transport(format!("{:#}", e)))?;
        debug!(chars = reply.len(), "planner replied");
        parse_reply(&reply)
    }
}

fn message_content(v: &Value) -> Result<String> {
    v.pointer("/choices/0/message/content")
        .and_then(|x| x.as_str())
        .map(|s| s.to_string())
        .context("missing choices[0].message.content")
}

/// The JSON object in a model reply, with or without a code fence.
pub fn extract_json(reply: &str) -> Option<&str> {
    let body = match reply.find("```") {
        Some(open) => {
            let rest = &reply[open + 3..];
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            match rest.find("```") {
                Some(close) => &rest[..close],
                None => rest,
            }
        }
        None => reply,
    };
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

pub fn parse_reply<T: for<'de> Deserialize<'de>>(reply: &str) -> Result<T, PlannerError> {
    let raw = extract_json(reply).ok_or_else(|| PlannerError::Decode("no JSON object in reply".into()))?;
    serde_json::from_str(raw).map_err(|e| PlannerError::Decode(e.to_string()))
}

fn render_snapshot(snapshot: &PageSnapshot) -> String {
    let mut s = format!("URL: {}\nTitle: {}\nInteractive elements:\n", snapshot.url, snapshot.title);
    for (i, el) in snapshot.elements.iter().enumerate().take(MAX_PROMPT_ELEMENTS) {
        if el.visible {
            s.push_str(&format!("[{}] {}\n", i, el.describe()));
        }
    }
    s
}

fn plan_system_prompt() -> String {
    format!(
        "You drive a web browser one small plan at a time. Reply with a single JSON object:\n\
         {{\"rationale\": string, \"estimated_seconds\": number, \"steps\": [step]}}\n\
         with between {} and {} steps. Each step is\n\
         {{\"description\": string, \"purpose\": string, \"action\": one of \
         \"click\"|\"fill_text\"|\"choose_option\"|\"submit_key\"|\"navigate\"|\"await\" or null, \
         \"element\": index of an element from the list or null, \
         \"selector_hint\": {{\"by\": \"css\", \"selector\": string}} or null, \
         \"value\": string or null, \
         \"test_criterion\": {{\"description\": string, \"check\": check}}}}\n\
         where check is one of {{\"kind\": \"url_changed\"}}, {{\"kind\": \"url_contains\", \"fragment\": string}}, \
         {{\"kind\": \"title_contains\", \"text\": string}}, {{\"kind\": \"text_visible\", \"text\": string}}, \
         {{\"kind\": \"element_visible\", \"target\": {{\"by\": \"css\", \"selector\": string}}}}, \
         {{\"kind\": \"input_value\", \"expected\": string}}.\n\
         Only plan what the current page allows. Every step needs an observable test criterion.",
        MIN_PLAN_STEPS, MAX_PLAN_STEPS
    )
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn propose_micro_plan(
        &self,
        goal: &str,
        snapshot: &PageSnapshot,
        history: &[String],
    ) -> Result<MicroPlan, PlannerError> {
        let done = if history.is_empty() {
            "nothing yet".to_string()
        } else {
            history.iter().enumerate().map(|(i, h)| format!("{}. {}", i + 1, h)).collect::<Vec<_>>().join("\n")
        };
        let user = format!("Goal: {}\n\nAlready done:\n{}\n\n{}", goal, done, render_snapshot(snapshot));
        self.ask(&plan_system_prompt(), &user).await
    }

    async fn is_goal_fulfilled(&self, goal: &str, page: &PageSnapshot) -> Result<bool, PlannerError> {
        let system = "Judge whether a browser automation goal is complete from the current page. \
                      Reply with JSON: {\"fulfilled\": true|false, \"reason\": string}.";
        let user = format!("Goal: {}\n\n{}", goal, render_snapshot(page));
        let verdict: GoalVerdict = self.ask(system, &user).await?;
        debug!(fulfilled = verdict.fulfilled, reason = %verdict.reason, "goal verdict");
        Ok(verdict.fulfilled)
    }

    async fn revise_micro_plan(&self, plan: &MicroPlan, feedback: &str) -> Result<MicroPlan, PlannerError> {
        let current = serde_json::to_string_pretty(plan).map_err(|e| PlannerError::Decode(e.to_string()))?;
        let user = format!(
            "A human reviewed this plan and asked for changes.\n\nPlan:\n{}\n\nFeedback: {}\n\n\
             Return the revised plan in the same JSON shape.",
            current, feedback
        );
        self.ask(&plan_system_prompt(), &user).await
    }

    async fn diagnose(&self, failure: &FailureRecord) -> Result<DiagnosisHint, PlannerError> {
        let system = "Explain briefly why a browser automation step failed. \
                      Reply with JSON: {\"summary\": string, \"suggestion\": string}.";
        let user = format!(
            "Step: {}\nError kind: {}\nMessage: {}\nURL: {}",
            failure.description,
            failure.kind.map(|k| k.as_str()).unwrap_or("plan_rejected"),
            failure.message,
            failure.url
        );
        self.ask(system, &user).await
    }
}
