use anyhow::Result;
use glass_pilot::browser::{BrowserConfig, ChromiumDriver, DomInspector};
use glass_pilot::gate::ConsoleGate;
use glass_pilot::llm::{LlmConfig, LlmPlanner};
use glass_pilot::store::DiskRunStore;
use glass_pilot::{EngineConfig, PlanLoopController};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let driver = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => ChromiumDriver::connect(&ws).await?,
        _ => ChromiumDriver::launch(BrowserConfig { headless: false, ..Default::default() }).await?,
    };
    let planner = LlmPlanner::new(LlmConfig::default())?;
    let runs_dir = std::env::temp_dir().join("glass_pilot_runs");

    let controller = PlanLoopController::new(
        driver,
        DomInspector,
        planner,
        ConsoleGate::new(),
        DiskRunStore::new(&runs_dir),
        EngineConfig::from_env(),
    );

    let goal = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Open the jobs page and search for Rust positions".to_string());
    let url = std::env::args().nth(2).unwrap_or_else(|| "https://news.ycombinator.com/jobs".to_string());

    let report = controller.run(&goal, &url).await;
    println!(
        "{:?} ({:?}): {} steps committed over {} plans; records in {}",
        report.status,
        report.reason,
        report.steps_committed,
        report.plans_issued,
        runs_dir.join(&report.run_id).display()
    );
    if let Some(e) = &report.persistence_error {
        eprintln!("report was not saved: {}", e);
    }
    Ok(())
}
