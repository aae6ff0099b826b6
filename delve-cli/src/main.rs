//! Delve CLI - command line front end for recursive deep research
//!
//! Logs and progress go to stderr; the final report or answer goes to stdout
//! (or `--output`) so it can be piped.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use delve_core::{
    init_logging, log_operation_error, log_operation_start, log_operation_success,
    CancellationToken, DelveConfig, LoggingConfig, OutputMode, SearchProviderKind,
};
use delve_llm::DelveLlmClient;
use delve_research::{
    max_nodes, DeepResearch, HistoryEntry, ProgressReporter, QueryPlanner, ResearchHistory,
    ResearchProgress,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "delve")]
#[command(about = "Recursive deep research: search, extract, follow up, report")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Research a topic and print a report or a short answer
    Research {
        /// Topic or question to research
        topic: String,

        /// Queries at the first level
        #[arg(short, long)]
        breadth: Option<usize>,

        /// Levels of follow-up research
        #[arg(short, long)]
        depth: Option<usize>,

        /// Output mode (report, answer)
        #[arg(short, long)]
        mode: Option<String>,

        /// Search provider (firecrawl, tavily, local)
        #[arg(long)]
        provider: Option<String>,

        /// Maximum concurrent research nodes
        #[arg(long)]
        concurrency: Option<usize>,

        /// Overall research timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Write the artifact to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Ask clarifying questions before researching
        #[arg(long)]
        clarify: bool,

        /// Do not record the run in history
        #[arg(long)]
        no_history: bool,
    },

    /// Suggest questions that sharpen a research topic
    Clarify {
        /// Topic to clarify
        topic: String,

        /// Maximum number of questions
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,
    },

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Initialize default configuration
        #[arg(long)]
        init: bool,

        /// Validate current configuration and credentials
        #[arg(long)]
        validate: bool,
    },

    /// Inspect past research runs
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List recorded runs
    List,
    /// Print a recorded artifact
    Show {
        /// Entry id or unambiguous prefix
        id: String,
    },
    /// Export history to a JSON file
    Export { path: PathBuf },
    /// Import entries from a JSON file
    Import { path: PathBuf },
    /// Remove every entry
    Clear,
}

struct ResearchArgs {
    topic: String,
    breadth: Option<usize>,
    depth: Option<usize>,
    mode: Option<String>,
    provider: Option<String>,
    concurrency: Option<usize>,
    timeout: Option<u64>,
    output: Option<PathBuf>,
    clarify: bool,
    no_history: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let logging_config = if cli.verbose {
        LoggingConfig::verbose()
    } else {
        LoggingConfig::default()
    };
    init_logging(&logging_config).map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting delve v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Research {
            topic,
            breadth,
            depth,
            mode,
            provider,
            concurrency,
            timeout,
            output,
            clarify,
            no_history,
        } => {
            let args = ResearchArgs {
                topic,
                breadth,
                depth,
                mode,
                provider,
                concurrency,
                timeout,
                output,
                clarify,
                no_history,
            };
            handle_research(args, cli.config.as_deref(), cli.verbose).await?;
        }
        Commands::Clarify { topic, count } => {
            handle_clarify(&topic, count, cli.config.as_deref()).await?;
        }
        Commands::Config {
            show,
            init,
            validate,
        } => {
            handle_config(show, init, validate, cli.config.as_deref()).await?;
        }
        Commands::History { action } => {
            handle_history(action).await?;
        }
    }

    Ok(())
}

/// Load the configuration file, then overlay the environment
fn load_config(config_path: Option<&Path>) -> anyhow::Result<DelveConfig> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            DelveConfig::from_file(path)?
        }
        None => {
            let default_paths = [
                dirs::config_dir().map(|d| d.join("delve").join("config.toml")),
                dirs::home_dir().map(|d| d.join(".delve").join("config.toml")),
                Some(PathBuf::from("delve.toml")),
            ];

            match default_paths.into_iter().flatten().find(|p| p.exists()) {
                Some(path) => {
                    info!("Loading configuration from {:?}", path);
                    DelveConfig::from_file(&path)?
                }
                None => {
                    info!("No configuration file found, using defaults");
                    DelveConfig::default()
                }
            }
        }
    };

    config.apply_env();
    Ok(config)
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|d| d.join(".config")))
        .map(|d| d.join("delve").join("config.toml"))
        .ok_or_else(|| anyhow!("Could not determine a configuration directory"))
}

async fn read_line() -> anyhow::Result<String> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}

async fn handle_research(
    args: ResearchArgs,
    config_path: Option<&Path>,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    let research = &mut config.research;
    if let Some(breadth) = args.breadth {
        research.breadth = breadth;
    }
    if let Some(depth) = args.depth {
        research.depth = depth;
    }
    if let Some(concurrency) = args.concurrency {
        research.concurrency = concurrency;
    }
    if let Some(timeout) = args.timeout {
        research.timeout_secs = Some(timeout);
    }
    if let Some(mode) = &args.mode {
        research.output_mode = mode.parse::<OutputMode>()?;
    }
    if let Some(provider) = &args.provider {
        config.search.provider = provider.parse::<SearchProviderKind>()?.to_string();
    }

    let session = DeepResearch::from_config(config).await?;
    let settings = session.config().research.clone();

    let prompt = if args.clarify {
        let questions = session.clarifying_questions(&args.topic, 3).await?;
        if questions.is_empty() {
            args.topic.clone()
        } else {
            eprintln!("A few questions to sharpen the research:");
            for (i, question) in questions.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, question);
            }
            eprintln!("Your answer (empty to skip):");
            let answer = read_line().await?;
            QueryPlanner::compose_research_prompt(&args.topic, &questions, &answer)
        }
    } else {
        args.topic.clone()
    };

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, finishing in-flight work and writing up partial results...");
                cancel.cancel();
            }
        })
    };

    let (reporter, rx) = ProgressReporter::channel(settings.progress_buffer);
    let progress = tokio::spawn(render_progress(
        rx,
        max_nodes(settings.breadth, settings.depth) as u64,
    ));

    log_operation_start!("research", breadth = settings.breadth, depth = settings.depth);
    let result = session.run(&prompt, cancel, Some(reporter)).await;
    ctrl_c.abort();
    finish_progress(progress).await;

    let run = match result {
        Ok(run) => run,
        Err(e) => {
            log_operation_error!("research", e);
            return Err(e.into());
        }
    };

    let outcome = &run.outcome;
    log_operation_success!(
        "research",
        findings = outcome.snapshot.findings.len(),
        duration_ms = outcome.duration_ms
    );
    eprintln!(
        "{} findings from {} documents across {} queries{}{}",
        outcome.snapshot.findings.len(),
        outcome.snapshot.documents.len(),
        outcome.tree.len(),
        if outcome.failures.is_empty() {
            String::new()
        } else {
            format!(", {} branches failed", outcome.failures.len())
        },
        if outcome.is_cancelled() {
            " (cancelled)"
        } else {
            ""
        }
    );
    if let Some(summary) = outcome.failure_summary() {
        eprintln!("{}", summary);
    }
    if verbose {
        eprint!("{}", outcome.tree.outline());
    }

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &run.artifact.content)
                .await
                .with_context(|| format!("Failed to write {:?}", path))?;
            eprintln!("Written to {:?}", path);
        }
        None => println!("{}", run.artifact.content),
    }

    if !args.no_history {
        let entry = HistoryEntry::from_run(&args.topic, &prompt, &run);
        if let Err(e) = record_history(entry).await {
            warn!(error = %e, "Could not record history");
        }
    }

    Ok(())
}

async fn render_progress(mut rx: mpsc::Receiver<ResearchProgress>, estimate: u64) {
    let pb = ProgressBar::new(estimate.max(1));
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
    {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => warn!(error = %e, "Invalid progress template"),
    }
    pb.set_message("planning");

    while let Some(event) = rx.recv().await {
        let length = pb.length().unwrap_or(0).max(event.total_nodes as u64);
        pb.set_length(length);
        pb.set_position(event.completed_nodes as u64);
        let query: String = event.query.chars().take(48).collect();
        pb.set_message(format!(
            "{} findings | {} {}",
            event.findings_total, event.status, query
        ));
    }

    pb.finish_and_clear();
}

/// Wait for the progress bar to drain. Returns false when the display task died.
async fn finish_progress(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Progress display task failed");
            false
        }
    }
}

async fn record_history(entry: HistoryEntry) -> anyhow::Result<()> {
    let mut history = ResearchHistory::load(ResearchHistory::default_path()?).await?;
    history.append(entry).await?;
    Ok(())
}

async fn handle_clarify(topic: &str, count: usize, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;

    let client = DelveLlmClient::new(config.llm.clone()).await?;
    let planner = QueryPlanner::new(
        Arc::new(client),
        config.llm.retry.clone(),
        config.research.query_similarity_threshold,
    );

    let questions = planner
        .clarifying_questions(topic, count, &CancellationToken::new())
        .await?;
    if questions.is_empty() {
        println!("The topic is clear enough, no questions.");
    }
    for (i, question) in questions.iter().enumerate() {
        println!("{}. {}", i + 1, question);
    }
    Ok(())
}

fn redacted(config: &DelveConfig) -> DelveConfig {
    let mask = |key: &Option<String>| key.as_ref().map(|_| "********".to_string());
    let mut shown = config.clone();
    shown.search.firecrawl_api_key = mask(&config.search.firecrawl_api_key);
    shown.search.tavily_api_key = mask(&config.search.tavily_api_key);
    shown.llm.api_key = mask(&config.llm.api_key);
    shown
}

async fn handle_config(
    show: bool,
    init: bool,
    validate: bool,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    if init {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        DelveConfig::default().save_to_file(&path)?;
        println!("Configuration initialized at: {:?}", path);
        println!("Edit the file or set FIRECRAWL_KEY / OPENAI_API_KEY in the environment.");
    }

    if show {
        let config = load_config(config_path)?;
        println!("{}", toml::to_string_pretty(&redacted(&config))?);
    }

    if validate {
        let config = load_config(config_path)?;
        let checked = config.validate().and_then(|_| config.validate_credentials());
        match checked {
            Ok(()) => println!("Configuration is valid"),
            Err(e) => {
                println!("Configuration validation failed: {}", e);
                if let Some(context) = e.context() {
                    for suggestion in &context.recovery_suggestions {
                        println!("  - {}", suggestion);
                    }
                }
                return Err(e.into());
            }
        }
    }

    if !(show || init || validate) {
        println!("Nothing to do. Use --show, --init or --validate.");
    }

    Ok(())
}

async fn handle_history(action: HistoryAction) -> anyhow::Result<()> {
    let mut history = ResearchHistory::load(ResearchHistory::default_path()?).await?;

    match action {
        HistoryAction::List => {
            if history.is_empty() {
                println!("No research history.");
            }
            for entry in history.entries() {
                let id = entry.id.to_string();
                println!(
                    "{}  {}  {:<6}  {}",
                    &id[..8],
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.mode,
                    entry.query.lines().next().unwrap_or_default()
                );
            }
        }
        HistoryAction::Show { id } => match history.get(&id) {
            Some(entry) => println!("{}", entry.content),
            None => return Err(anyhow!("No unique history entry matches '{}'", id)),
        },
        HistoryAction::Export { path } => {
            history.export(&path).await?;
            println!("Exported {} entries to {:?}", history.len(), path);
        }
        HistoryAction::Import { path } => {
            let added = history.import(&path).await?;
            println!("Imported {} new entries", added);
        }
        HistoryAction::Clear => {
            history.clear().await?;
            println!("History cleared");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finish_progress_survives_a_dead_display_task() {
        let (reporter, rx) = ProgressReporter::channel(4);
        drop(reporter);
        assert!(finish_progress(tokio::spawn(render_progress(rx, 1))).await);

        let dead = tokio::spawn(async { panic!("display crashed") });
        assert!(!finish_progress(dead).await);
    }
}
