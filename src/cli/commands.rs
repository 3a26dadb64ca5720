//! CLI command definitions for prompt-forge.
//!
//! Every subcommand is one call on [`PromptForge`]; results are printed as
//! pretty JSON and failures carry their reason code.

use std::fs;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::{ForgeConfig, ScorerKind};
use crate::error::ForgeError;
use crate::service::PromptForge;
use crate::types::Ordinal;

/// Iterative prompt optimization against generated test cases.
#[derive(Parser)]
#[command(name = "prompt-forge")]
#[command(about = "Generate test cases, evaluate and optimize prompt templates")]
#[command(version)]
#[command(
    long_about = "prompt-forge measures a prompt template against synthetic test cases and asks an LLM for improved versions.\n\nEvery version is kept in an append-only history, so versions can be compared and rolled back.\n\nExample usage:\n  prompt-forge create \"News digest\" --prompt \"Summarize: {{article}}\"\n  prompt-forge generate news-digest -n 5\n  prompt-forge loop news-digest --target 0.9"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite database URL.
    #[arg(long, env = "PROMPT_FORGE_DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// OpenAI-compatible API base URL (OpenRouter when omitted).
    #[arg(long, env = "LITELLM_API_BASE", global = true)]
    pub api_base: Option<String>,

    /// API key (can also be set via LITELLM_API_KEY or OPENROUTER_API_KEY env var).
    #[arg(long, global = true)]
    pub api_key: Option<String>,

    /// Model used for completions, generation and optimization.
    #[arg(short = 'm', long, env = "LITELLM_DEFAULT_MODEL", global = true)]
    pub model: Option<String>,

    /// Scorer for evaluation outputs: heuristic or judge.
    #[arg(long, global = true)]
    pub scorer: Option<String>,

    /// Per-attempt timeout for model calls, in seconds.
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Create a project with its initial prompt version.
    Create(CreateArgs),

    /// List projects.
    Projects,

    /// Show the latest (or a specific) prompt version.
    Prompt(PromptArgs),

    /// Generate a new batch of test cases for a project.
    #[command(alias = "gen")]
    Generate(GenerateArgs),

    /// Evaluate a prompt version against the latest test batch.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),

    /// Propose an improved prompt version from evaluation failures.
    Optimize(SlugArgs),

    /// Show every version with its latest evaluation scores.
    History(SlugArgs),

    /// Compare two versions evaluated on the latest batch.
    Compare(CompareArgs),

    /// Append a copy of an older version as the newest version.
    Rollback(RollbackArgs),

    /// Alternate optimize and evaluate until a target score is reached.
    Loop(LoopArgs),
}

/// Arguments for `prompt-forge create`.
#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// Human-readable project name.
    pub label: String,

    /// Explicit slug (derived from the label when omitted).
    #[arg(long)]
    pub slug: Option<String>,

    /// Initial prompt template, with {{variable}} placeholders.
    #[arg(short = 'p', long, conflicts_with = "prompt_file", required_unless_present = "prompt_file")]
    pub prompt: Option<String>,

    /// Read the initial prompt template from a file.
    #[arg(long)]
    pub prompt_file: Option<String>,
}

/// Arguments naming just a project.
#[derive(Parser, Debug)]
pub struct SlugArgs {
    /// Project slug.
    pub slug: String,
}

/// Arguments for `prompt-forge prompt`.
#[derive(Parser, Debug)]
pub struct PromptArgs {
    /// Project slug.
    pub slug: String,

    /// Version ordinal (latest when omitted).
    #[arg(long)]
    pub version: Option<Ordinal>,
}

/// Arguments for `prompt-forge generate`.
#[derive(Parser, Debug)]
pub struct GenerateArgs {
    /// Project slug.
    pub slug: String,

    /// Number of test cases to generate.
    #[arg(short = 'n', long, default_value = "5")]
    pub count: usize,
}

/// Arguments for `prompt-forge evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Project slug.
    pub slug: String,

    /// Version ordinal (latest when omitted).
    #[arg(long)]
    pub version: Option<Ordinal>,
}

/// Arguments for `prompt-forge compare`.
#[derive(Parser, Debug)]
pub struct CompareArgs {
    /// Project slug.
    pub slug: String,

    /// Baseline version ordinal.
    pub baseline: Ordinal,

    /// Candidate version ordinal.
    pub candidate: Ordinal,
}

/// Arguments for `prompt-forge rollback`.
#[derive(Parser, Debug)]
pub struct RollbackArgs {
    /// Project slug.
    pub slug: String,

    /// Version ordinal to restore.
    pub ordinal: Ordinal,
}

/// Arguments for `prompt-forge loop`.
#[derive(Parser, Debug)]
pub struct LoopArgs {
    /// Project slug.
    pub slug: String,

    /// Aggregate score at which the loop stops.
    #[arg(long, default_value = "0.9")]
    pub target: f64,

    /// Maximum optimize/evaluate iterations.
    #[arg(long, default_value = "3")]
    pub max_iterations: u32,
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
    let config = build_config(&cli)?;
    info!(
        database_url = %config.database_url,
        model = %config.model,
        "Starting prompt-forge"
    );
    let forge = if cli.command.calls_model() {
        PromptForge::connect(&config).await
    } else {
        PromptForge::open_offline(&config).await
    }
    .map_err(report)?;

    match cli.command {
        Commands::Create(args) => {
            let prompt = match (args.prompt, args.prompt_file) {
                (Some(prompt), _) => prompt,
                (None, Some(path)) => fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("Failed to read prompt file {}: {}", path, e))?,
                (None, None) => return Err(anyhow::anyhow!("--prompt or --prompt-file is required")),
            };
            let (project, version) = forge
                .create_project(&args.label, args.slug.as_deref(), &prompt)
                .await
                .map_err(report)?;
            print_json(&CreateOutput { project, version })
        }
        Commands::Projects => print_json(&forge.list_projects().await.map_err(report)?),
        Commands::Prompt(args) => {
            let version = match args.version {
                Some(ordinal) => forge.get_version(&args.slug, ordinal).await,
                None => forge.get_prompt(&args.slug).await,
            };
            print_json(&version.map_err(report)?)
        }
        Commands::Generate(args) => {
            let batch = forge
                .generate_data(&args.slug, args.count)
                .await
                .map_err(report)?;
            print_json(&batch)
        }
        Commands::Evaluate(args) => {
            let run = match args.version {
                Some(ordinal) => forge.evaluate_version(&args.slug, ordinal).await,
                None => forge.evaluate(&args.slug).await,
            }
            .map_err(report)?;
            print_json(&EvaluateOutput {
                summary: run.summary(),
                results: run.results,
            })
        }
        Commands::Optimize(args) => print_json(&forge.optimize(&args.slug).await.map_err(report)?),
        Commands::History(args) => print_json(&forge.history(&args.slug).await.map_err(report)?),
        Commands::Compare(args) => print_json(
            &forge
                .compare(&args.slug, args.baseline, args.candidate)
                .await
                .map_err(report)?,
        ),
        Commands::Rollback(args) => print_json(
            &forge
                .rollback(&args.slug, args.ordinal)
                .await
                .map_err(report)?,
        ),
        Commands::Loop(args) => print_json(
            &forge
                .run_loop(&args.slug, args.target, args.max_iterations)
                .await
                .map_err(report)?,
        ),
    }
}

impl Commands {
    /// Whether the command needs an LLM endpoint.
    pub fn calls_model(&self) -> bool {
        matches!(
            self,
            Commands::Generate(_)
                | Commands::Evaluate(_)
                | Commands::Optimize(_)
                | Commands::Loop(_)
        )
    }
}

#[derive(Debug, Serialize)]
struct CreateOutput {
    project: crate::types::Project,
    version: crate::types::PromptVersion,
}

#[derive(Debug, Serialize)]
struct EvaluateOutput {
    summary: crate::types::RunSummary,
    results: Vec<crate::types::EvaluationResult>,
}

/// Environment configuration with CLI flags applied on top.
fn build_config(cli: &Cli) -> anyhow::Result<ForgeConfig> {
    let mut config = ForgeConfig::from_env()?;

    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    if let Some(base) = &cli.api_base {
        config.api_base = Some(base.clone());
    }
    if let Some(key) = &cli.api_key {
        config.api_key = Some(key.clone());
    }
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(scorer) = &cli.scorer {
        config.scorer = scorer
            .parse::<ScorerKind>()
            .map_err(|e| anyhow::anyhow!("Invalid --scorer: {}", e))?;
    }
    if let Some(secs) = cli.timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }

    config.validate()?;
    Ok(config)
}

/// Attaches the stable reason code to a request failure.
fn report(err: ForgeError) -> anyhow::Error {
    anyhow::anyhow!("{} [{}]", err, err.reason())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json);
    Ok(())
}
