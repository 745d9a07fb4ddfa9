use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::model::MicroPlan;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Approve,
    Modify(String),
    Cancel,
}

/// Approval checkpoint between planning and execution. `present` may block
/// for as long as the human takes.
#[async_trait]
pub trait HumanGate: Send + Sync {
    async fn present(&self, plan: &MicroPlan) -> Decision;
}

/// Approves every plan.
#[derive(Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl HumanGate for AutoApprove {
    async fn present(&self, _plan: &MicroPlan) -> Decision {
        Decision::Approve
    }
}

/// Prints the plan to stdout and reads the decision from stdin.
///
/// `y` approves, `n` or `q` cancels, anything else is sent back as feedback.
/// End of input cancels.
pub struct ConsoleGate {
    stdin: Mutex<BufReader<tokio::io::Stdin>>,
}

impl ConsoleGate {
    pub fn new() -> Self {
        Self { stdin: Mutex::new(BufReader::new(tokio::io::stdin())) }
    }
}

impl Default for ConsoleGate {
    fn default() -> Self {
        Self::new()
    }
}

pub fn render_plan(plan: &MicroPlan) -> String {
    let mut s = String::new();
    if let Some(why) = plan.rationale.as_deref().filter(|r| !r.is_empty()) {
        s.push_str(&format!("Plan: {}\n", why));
    }
    for (i, step) in plan.steps.iter().enumerate() {
        let action = step.action.map(|a| format!("{:?}", a)).unwrap_or_else(|| "auto".into());
        s.push_str(&format!("  {}. [{}] {}\n", i + 1, action, step.description));
        s.push_str(&format!("       check: {}\n", step.test_criterion.description));
    }
    s.push_str(&format!("  (~{}s)\n", plan.estimated_seconds));
    s
}

pub fn parse_decision(line: &str) -> Decision {
    let line = line.trim();
    match line.to_lowercase().as_str() {
        "y" | "yes" => Decision::Approve,
        "" | "n" | "no" | "q" | "quit" => Decision::Cancel,
        _ => Decision::Modify(line.to_string()),
    }
}

#[async_trait]
impl HumanGate for ConsoleGate {
    async fn present(&self, plan: &MicroPlan) -> Decision {
        let prompt = format!("{}Approve? [y = run, n = cancel, or type feedback]: ", render_plan(plan));
        let mut out = tokio::io::stdout();
        if let Err(e) = out.write_all(prompt.as_bytes()).await {
            warn!("cannot write plan to stdout: {}", e);
        }
        let _ = out.flush().await;

        let mut line = String::new();
        let mut stdin = self.stdin.lock().await;
        match stdin.read_line(&mut line).await {
            Ok(0) => Decision::Cancel,
            Ok(_) => parse_decision(&line),
            Err(e) => {
                warn!("cannot read decision: {}", e);
                Decision::Cancel
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_from_console_input() {
        assert_eq!(parse_decision("y\n"), Decision::Approve);
        assert_eq!(parse_decision(" Q "), Decision::Cancel);
        assert_eq!(parse_decision("\n"), Decision::Cancel);
        assert_eq!(
            parse_decision("use the search box instead\n"),
            Decision::Modify("use the search box instead".into())
        );
    }
}
