use anyhow::{Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webpilot::brain::LlmPlanner;
use webpilot::engine::{Engine, EngineConfig};
use webpilot::hands::{Browser, BrowserSession};
use webpilot::types::{DEFAULT_MAX_RETRIES, DEFAULT_MAX_STEPS, DEFAULT_WAIT_MS};
use webpilot::{face, task::TaskResult};

#[derive(Parser)]
#[command(
    name = "webpilot",
    about = "Drive a browser from a natural-language instruction"
)]
struct Cli {
    /// What the agent should accomplish.
    instruction: Option<String>,
    /// The page to start from.
    url: Option<String>,
    /// Run Chrome without a visible window.
    #[arg(long)]
    headless: bool,
    /// Step budget for the task.
    #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
    max_steps: u32,
    /// Consecutive-failure budget before the task is abandoned.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,
    /// Skip the indexed-element overlay markers.
    #[arg(long)]
    no_highlight: bool,
    /// Serve the web console instead of running one task.
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webpilot=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig {
        max_steps: cli.max_steps,
        max_retries: cli.max_retries,
        highlight: !cli.no_highlight,
        default_wait_ms: DEFAULT_WAIT_MS,
    };

    info!("launching browser");
    let headless = cli.headless;
    let session = tokio::task::spawn_blocking(move || BrowserSession::launch(headless))
        .await
        .map_err(|e| anyhow::anyhow!("browser launch panicked: {e}"))??;
    let session = Arc::new(session);

    if cli.serve {
        let console_browser: Arc<dyn Browser> = session.clone();
        let (mut cmd_rx, event_tx) = face::start_server(console_browser).await;
        let planner = LlmPlanner::from_env()?;
        let mut engine = Engine::new(session.clone(), planner)
            .with_config(config)
            .with_events(event_tx);

        while let Some(cmd) = cmd_rx.recv().await {
            let result = engine.run(&cmd.instruction, &cmd.url).await;
            report(&result);
        }
        return Ok(());
    }

    let (instruction, url) = match (cli.instruction, cli.url) {
        (Some(i), Some(u)) => (i, u),
        _ => bail!("provide an INSTRUCTION and a URL, or run with --serve"),
    };

    let planner = LlmPlanner::from_env()?;
    let mut engine = Engine::new(session.clone(), planner).with_config(config);
    let result = engine.run(&instruction, &url).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    let closer = session.clone();
    let _ = tokio::task::spawn_blocking(move || closer.close()).await;

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn report(result: &TaskResult) {
    info!(
        success = result.success,
        steps = result.total_steps,
        items = result.extracted_items,
        "task finished"
    );
}
