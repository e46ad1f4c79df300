//! Bot detection orchestrator CLI
//!
//! Reads one JSON request per line and prints one classification per line.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zentinel_bot_orchestrator::detectors::DetectionContext;
use zentinel_bot_orchestrator::{AgentConfig, BotDetectionAgent};

#[derive(Parser, Debug)]
#[command(name = "zentinel-bot-orchestrator")]
#[command(author, version, about = "Blackboard bot detection for Zentinel")]
struct Args {
    /// Path to configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON-lines file of requests (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr, classifications to stdout
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, &args.log_level);

    let config = match &args.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AgentConfig::default(),
    };

    let agent = BotDetectionAgent::new(config)?;
    if let Err(e) = agent.reputation().load().await {
        warn!(error = %e, "Continuing without stored reputations");
    }
    let maintenance = agent.reputation().start_periodic_maintenance();

    let processed = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            classify_lines(&agent, file).await?
        }
        None => classify_lines(&agent, tokio::io::stdin()).await?,
    };

    if let Err(e) = agent.reputation().persist().await {
        warn!(error = %e, "Reputations not persisted");
    }
    maintenance.abort();
    info!(processed, reputations = agent.reputation().len(), "Done");
    Ok(())
}

/// Classify each non-empty line; malformed lines are logged and skipped.
async fn classify_lines<R>(agent: &BotDetectionAgent, input: R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut processed = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let request: DetectionContext = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed request");
                continue;
            }
        };

        let classification = agent.classify(request).await;
        println!("{}", serde_json::to_string(&classification)?);
        processed += 1;
    }
    Ok(processed)
}
