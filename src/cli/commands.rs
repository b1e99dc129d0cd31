//! CLI command definitions for prp-relay.
//!
//! `run` starts the whole pipeline in one process; the other commands are
//! operator tools that talk to Redis directly.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use redis::AsyncCommands;
use tracing::info;

use crate::config::Settings;
use crate::llm::AnthropicProvider;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::orchestrator::{Supervisor, SupervisorOptions};
use crate::prp::{history, keys, status, Prp};
use crate::scheduler::{connect_manager, RetryPolicy, Stage, StageQueue, Watchdog};

/// Roles whose history lengths `status` reports.
const HISTORY_ROLES: [&str; 4] = ["pm", "validator", "integration", keys::QA_ROLE];

/// Redis-queued PM → Validator → Integration pipeline driving Claude.
#[derive(Parser)]
#[command(name = "prp-relay")]
#[command(about = "Run and inspect a Redis-queued multi-agent delivery pipeline")]
#[command(version)]
#[command(
    long_about = "prp-relay moves Product Requirement Prompts (PRPs) through PM, validation and integration agents backed by Claude.\n\nExample usage:\n  prp-relay submit --title \"Login\" --file prp.md\n  prp-relay run\n  prp-relay queues"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL; overrides the environment configuration.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start every agent, the Q&A orchestrator and the watchdog.
    Run(RunArgs),

    /// Create a PRP and enqueue it for the PM agent.
    Submit(SubmitArgs),

    /// Print a PRP hash and its history lengths.
    Status(StatusArgs),

    /// Print pending / inflight / dead-letter depth per stage.
    Queues(QueuesArgs),

    /// Print agent status hashes.
    Agents(AgentsArgs),

    /// Run one watchdog sweep and print the report.
    Sweep(SweepArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run without the Q&A orchestrator; agents never ask questions.
    #[arg(long)]
    pub no_qa: bool,

    /// Run without the inflight watchdog.
    #[arg(long)]
    pub no_watchdog: bool,
}

#[derive(Parser, Debug)]
#[command(group(clap::ArgGroup::new("body").required(true).args(["content", "file"])))]
pub struct SubmitArgs {
    /// PRP title.
    #[arg(short, long)]
    pub title: String,

    /// PRP body.
    #[arg(short, long)]
    pub content: Option<String>,

    /// Read the PRP body from a file.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Explicit PRP id (default: random UUID).
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// PRP id.
    pub id: String,

    /// Output as JSON.
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct QueuesArgs {
    /// Print Prometheus text exposition instead of a table.
    #[arg(long)]
    pub prometheus: bool,
}

#[derive(Parser, Debug)]
pub struct AgentsArgs {
    /// Output as JSON.
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Output as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = load_settings(cli.redis_url.as_deref())?;
    match cli.command {
        Commands::Run(args) => run_pipeline(settings, args).await,
        Commands::Submit(args) => run_submit(settings, args).await,
        Commands::Status(args) => run_status(settings, args).await,
        Commands::Queues(args) => run_queues(settings, args).await,
        Commands::Agents(args) => run_agents(settings, args).await,
        Commands::Sweep(args) => run_sweep(settings, args).await,
    }
}

/// Environment settings with CLI overrides, installed process-wide.
fn load_settings(redis_url: Option<&str>) -> anyhow::Result<&'static Settings> {
    let mut settings = Settings::from_env().context("invalid configuration")?;
    if let Some(url) = redis_url {
        settings = settings.with_redis_url(url);
    }
    settings.validate().context("invalid configuration")?;
    Settings::install(settings).map_err(|_| anyhow::anyhow!("settings already initialized"))
}

async fn run_pipeline(settings: &Settings, args: RunArgs) -> anyhow::Result<()> {
    let provider = AnthropicProvider::from_settings(settings)
        .context("failed to create Claude client")?;
    info!(
        redis_url = %settings.redis_url,
        model = %settings.model,
        api_key = %provider.api_key_masked(),
        profile = ?settings.profile,
        "Starting pipeline"
    );

    let options = SupervisorOptions {
        qa: !args.no_qa,
        watchdog: !args.no_watchdog,
    };
    Supervisor::new(settings.clone(), Arc::new(provider), options)
        .run()
        .await?;
    Ok(())
}

async fn run_submit(settings: &Settings, args: SubmitArgs) -> anyhow::Result<()> {
    let content = match (args.content, args.file) {
        (Some(content), _) => content,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("either --content or --file is required"),
    };
    if content.trim().is_empty() {
        anyhow::bail!("PRP content is empty");
    }

    let prp = match args.id {
        Some(id) => Prp::with_id(id, args.title, content),
        None => Prp::new(args.title, content),
    };

    let queue = StageQueue::connect(
        &settings.redis_url,
        Stage::Pm,
        RetryPolicy::new(settings.max_retries),
    )
    .await?;
    queue.submit(&prp).await?;
    println!("{}", prp.id);
    Ok(())
}

async fn run_status(settings: &Settings, args: StatusArgs) -> anyhow::Result<()> {
    let mut conn = connect_manager(&settings.redis_url).await?;
    let hash: BTreeMap<String, String> = conn.hgetall(keys::prp_key(&args.id)).await?;
    if hash.is_empty() {
        anyhow::bail!("PRP {} not found", args.id);
    }

    let mut lengths = BTreeMap::new();
    for role in HISTORY_ROLES {
        lengths.insert(role, history::len(&mut conn, &args.id, role).await?);
    }

    if args.json {
        let out = serde_json::json!({ "prp": hash, "history": lengths });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("PRP {}", args.id);
    let width = hash.keys().map(String::len).max().unwrap_or(0);
    for (name, value) in &hash {
        let shown = if name == "content" && value.len() > 200 {
            format!("{}… ({} bytes)", truncate(value, 200), value.len())
        } else {
            value.clone()
        };
        println!("  {:width$}  {}", name, shown, width = width);
    }
    println!("History:");
    for (role, n) in &lengths {
        println!("  {:12} {}", role, n);
    }
    Ok(())
}

async fn run_queues(settings: &Settings, args: QueuesArgs) -> anyhow::Result<()> {
    let conn = connect_manager(&settings.redis_url).await?;
    let policy = RetryPolicy::new(settings.max_retries);
    let mut rows = Vec::new();
    for stage in Stage::ALL {
        let queue = StageQueue::from_connection(conn.clone(), stage, policy);
        rows.push((stage, queue.depths().await?));
    }

    if args.prometheus {
        init_metrics();
        let metrics = MetricsCollector::new();
        for (stage, stats) in &rows {
            metrics.set_queue_depth(stage.queue(), stats);
        }
        print!("{}", export_metrics());
        return Ok(());
    }

    println!("{:20} {:>8} {:>9} {:>12}", "QUEUE", "PENDING", "INFLIGHT", "DEAD LETTER");
    for (stage, stats) in &rows {
        println!(
            "{:20} {:>8} {:>9} {:>12}",
            stage.queue(),
            stats.pending,
            stats.inflight,
            stats.dead_letter
        );
    }
    Ok(())
}

async fn run_agents(settings: &Settings, args: AgentsArgs) -> anyhow::Result<()> {
    let mut conn = connect_manager(&settings.redis_url).await?;
    let agents = status::read_all(&mut conn).await?;
    let now = chrono::Utc::now().timestamp();
    let stale_after = settings.agent_stale_after.as_secs();

    if args.json {
        let out: Vec<serde_json::Value> = agents
            .iter()
            .map(|a| {
                serde_json::json!({
                    "agent_id": a.agent_id,
                    "role": a.role,
                    "status": a.state.as_str(),
                    "current_prp": a.current_prp,
                    "last_activity": a.last_activity,
                    "processed": a.processed,
                    "failed": a.failed,
                    "stale": a.is_stale(now, stale_after),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }
    println!(
        "{:24} {:12} {:20} {:>6} {:>9} {:>6}  CURRENT",
        "AGENT", "ROLE", "STATUS", "IDLE", "PROCESSED", "FAILED"
    );
    for a in &agents {
        let state = if a.is_stale(now, stale_after) {
            format!("{} (stale)", a.state)
        } else {
            a.state.to_string()
        };
        println!(
            "{:24} {:12} {:20} {:>5}s {:>9} {:>6}  {}",
            a.agent_id,
            a.role,
            state,
            a.idle_for(now),
            a.processed,
            a.failed,
            a.current_prp.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_sweep(settings: &Settings, args: SweepArgs) -> anyhow::Result<()> {
    init_metrics();
    let conn = connect_manager(&settings.redis_url).await?;
    let report = Watchdog::new(conn, settings).sweep().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("scanned:          {}", report.scanned);
        println!("recovered:        {}", report.recovered);
        println!("failed:           {}", report.failed);
        println!("stamped:          {}", report.stamped);
        println!("orphans:          {}", report.orphans);
        println!("histories pruned: {}", report.histories_pruned);
        println!("skipped on error: {}", report.errors);
    }
    Ok(())
}

/// At most `max` bytes of `s`, cut on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from(["prp-relay", "run", "--no-qa"]).expect("should parse");
        match cli.command {
            Commands::Run(args) => {
                assert!(args.no_qa);
                assert!(!args.no_watchdog);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_submit_requires_body() {
        assert!(Cli::try_parse_from(["prp-relay", "submit", "--title", "Login"]).is_err());
        assert!(Cli::try_parse_from([
            "prp-relay", "submit", "-t", "Login", "-c", "body", "-f", "prp.md"
        ])
        .is_err());

        let cli = Cli::try_parse_from([
            "prp-relay", "submit", "--title", "Login", "--file", "prp.md", "--id", "42",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.title, "Login");
                assert_eq!(args.file, Some(PathBuf::from("prp.md")));
                assert!(args.content.is_none());
                assert_eq!(args.id.as_deref(), Some("42"));
            }
            _ => panic!("Expected Submit command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "prp-relay",
            "queues",
            "--prometheus",
            "--log-level",
            "debug",
            "--redis-url",
            "redis://cache:6379",
        ])
        .expect("should parse");
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6379"));
        assert!(matches!(cli.command, Commands::Queues(QueuesArgs { prometheus: true })));
    }

    #[test]
    fn test_status_and_agents_json() {
        let cli = Cli::try_parse_from(["prp-relay", "status", "7", "--json"]).expect("should parse");
        match cli.command {
            Commands::Status(args) => {
                assert_eq!(args.id, "7");
                assert!(args.json);
            }
            _ => panic!("Expected Status command"),
        }
        let cli = Cli::try_parse_from(["prp-relay", "agents"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Agents(AgentsArgs { json: false })));
        let cli = Cli::try_parse_from(["prp-relay", "sweep", "-j"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Sweep(SweepArgs { json: true })));
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 10), "short");
    }
}
