use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use lore_analysis::{AnalysisConfig, CascadeRequest, Engine, Initiator};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

mod consent;
mod flags;
mod render;

use flags::TierFlag;

#[derive(Parser)]
#[command(
    name = "lore",
    about = "Tiered project analysis backed by crowd consensus",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to <project>/.lore/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Approve scans and analysis runs without asking
    #[arg(short = 'y', long, global = true)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the project from a crowd of quick votes
    Scan(ScanArgs),

    /// Run an analysis tier, optionally continuing up the cascade
    Analyze(AnalyzeArgs),

    /// Show scan, per-tier freshness and health without calling a model
    Status(StatusArgs),
}

#[derive(Args)]
struct ScanArgs {
    /// Project directory
    path: PathBuf,

    /// Output JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Project directory
    path: PathBuf,

    /// Tier to start from
    #[arg(long, value_enum)]
    tier: TierFlag,

    /// Continue through every higher tier
    #[arg(long = "continue", conflicts_with = "continue_to")]
    continue_all: bool,

    /// Continue up to and including this tier
    #[arg(long, value_enum, value_name = "TIER")]
    continue_to: Option<TierFlag>,

    /// Recompute even when the cached result is fresh
    #[arg(long)]
    force: bool,

    /// Drop existing documents and previous items before recomputing
    #[arg(long)]
    reset: bool,

    /// Output JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Project directory
    path: PathBuf,

    /// Output JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Commands::Scan(ref args) => run_scan(&cli, args, &cancel).await,
        Commands::Analyze(ref args) => run_analyze(&cli, args, &cancel).await,
        Commands::Status(ref args) => run_status(&cli, args).await,
    }
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling in-flight model calls");
            cancel.cancel();
        }
    });
}

fn build_engine(cli: &Cli, project: &Path) -> Result<Engine> {
    let config = AnalysisConfig::load(project, cli.config.as_deref())
        .with_context(|| format!("Failed to load configuration for {}", project.display()))?;
    let gate = consent::gate(cli.yes);
    let engine = Engine::builder(config).gate(gate).build()?;
    Ok(engine)
}

async fn run_scan(cli: &Cli, args: &ScanArgs, cancel: &CancellationToken) -> Result<()> {
    let engine = build_engine(cli, &args.path)?;
    let scan = engine
        .scan(&args.path, Initiator::User, cancel)
        .await
        .with_context(|| format!("Scan of {} failed", args.path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&scan)?);
    } else {
        print!("{}", render::scan(&scan));
    }
    Ok(())
}

async fn run_analyze(cli: &Cli, args: &AnalyzeArgs, cancel: &CancellationToken) -> Result<()> {
    let engine = build_engine(cli, &args.path)?;
    let mut request = CascadeRequest::new(&args.path, args.tier.as_domain())
        .with_force(args.force)
        .with_reset(args.reset)
        .with_initiator(Initiator::User);
    if args.continue_all {
        request = request.continue_all();
    } else if let Some(last) = args.continue_to {
        request = request.continue_to(last.as_domain());
    }

    let results = engine
        .analyze(&request, cancel)
        .await
        .with_context(|| format!("Analysis of {} failed", args.path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for result in &results {
            print!("{}", render::analysis(result));
        }
    }
    Ok(())
}

async fn run_status(cli: &Cli, args: &StatusArgs) -> Result<()> {
    let engine = build_engine(cli, &args.path)?;
    let status = engine
        .status(&args.path)
        .await
        .with_context(|| format!("Status of {} unavailable", args.path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render::status(&status));
    }
    Ok(())
}
