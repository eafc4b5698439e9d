//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use newsfeed_core::{
    ArtifactStore, BrevoDelivery, OpenRouterService, PipelineCoordinator, ProgressReporter,
    RunPlan, Services,
};
use newsfeed_search::{QueryTemplate, SerperProvider};
use newsfeed_shared::{
    AppConfig, PipelineRun, RunStatus, StageName, init_config, load_config, load_config_from,
    load_entities, require_api_key,
};
use newsfeed_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// newsfeed: periodic news digests about tracked entities.
#[derive(Parser)]
#[command(
    name = "newsfeed",
    version,
    about = "Search, score, enrich, and summarize news about tracked entities, then email the digest.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.newsfeed/newsfeed.toml).
    #[arg(long, global = true, env = "NEWSFEED_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline, fully or from/for selected stages.
    Run(RunArgs),

    /// Show the latest run and recent history.
    Status {
        /// Output directory (overrides run.output_dir).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of ledger runs to list.
        #[arg(long, default_value = "5")]
        history: u32,
    },

    /// Transform cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Entity list tools.
    Entities {
        #[command(subcommand)]
        action: EntitiesAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Start at this stage and run through delivery.
    #[arg(long, value_name = "STAGE", group = "plan")]
    pub from: Option<StageName>,

    /// Run a single stage.
    #[arg(long, value_name = "STAGE", group = "plan")]
    pub only: Option<StageName>,

    /// Search only.
    #[arg(long, group = "plan")]
    pub search_only: bool,

    /// Filter, enrich, and summarize from existing search results.
    #[arg(long, group = "plan")]
    pub analyze_only: bool,

    /// Deliver the existing summary report.
    #[arg(long, group = "plan")]
    pub email_only: bool,

    /// Output directory (overrides run.output_dir).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Entity list (overrides run.entities_path).
    #[arg(short, long)]
    pub entities: Option<PathBuf>,
}

impl RunArgs {
    pub fn plan(&self) -> RunPlan {
        if let Some(stage) = self.from {
            RunPlan::From(stage)
        } else if let Some(stage) = self.only {
            RunPlan::Only(stage)
        } else if self.search_only {
            RunPlan::Only(StageName::Search)
        } else if self.analyze_only {
            RunPlan::Range(StageName::Filter, StageName::Summarize)
        } else if self.email_only {
            RunPlan::Only(StageName::Deliver)
        } else {
            RunPlan::Full
        }
    }
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Forget cached transform results so the next run asks again.
    Clear {
        /// Only this stage (filter, enrich, or summarize). Defaults to all.
        #[arg(value_name = "STAGE")]
        stage: Option<StageName>,
    },
}

/// Entity subcommands.
#[derive(Subcommand)]
pub(crate) enum EntitiesAction {
    /// Validate the entity list and preview each search query.
    Check {
        /// Entity list (overrides run.entities_path).
        #[arg(short, long)]
        entities: Option<PathBuf>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "newsfeed=info",
        1 => "newsfeed=debug",
        _ => "newsfeed=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run(args) => cmd_run(config_path.as_deref(), &args).await,
        Command::Status { output, history } => {
            cmd_status(config_path.as_deref(), output, history).await
        }
        Command::Cache { action } => match action {
            CacheAction::Clear { stage } => cmd_cache_clear(config_path.as_deref(), stage).await,
        },
        Command::Entities { action } => match action {
            EntitiesAction::Check { entities } => {
                cmd_entities_check(config_path.as_deref(), entities)
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, args: &RunArgs) -> Result<()> {
    let mut config = resolve_config(config_path)?;
    if let Some(out) = &args.output {
        config.run.output_dir = out.display().to_string();
    }
    if let Some(entities) = &args.entities {
        config.run.entities_path = entities.display().to_string();
    }

    let plan = args.plan();
    let entities = if plan.includes(StageName::Search) {
        load_entities(Path::new(&config.run.entities_path))?
    } else {
        Vec::new()
    };
    let services = build_services(&config, plan).await?;

    info!(
        %plan,
        output_dir = %config.run.output_dir,
        entities = entities.len(),
        "starting run"
    );

    let output_dir = config.run.output_dir.clone();
    let coordinator = PipelineCoordinator::new(config, services).with_entities(entities);
    let reporter = CliProgress::new();
    let run = coordinator.run(plan, &reporter).await?;

    print_run(&run, Path::new(&output_dir));

    match &run.status {
        RunStatus::Completed => Ok(()),
        status => Err(eyre!("run {}: {status}", run.run_id)),
    }
}

/// Construct only the clients the plan needs, so e.g. `--email-only`
/// does not require search or transform credentials.
async fn build_services(config: &AppConfig, plan: RunPlan) -> Result<Services> {
    let timeout = Duration::from_secs(config.retry.timeout_secs);
    let mut services = Services::default();

    if plan.includes(StageName::Search) {
        let key = require_api_key(&config.search.api_key_env)?;
        services.search = Some(Arc::new(SerperProvider::new(
            &config.search.endpoint,
            key,
            timeout,
        )?));
    }

    if StageName::TRANSFORMS.iter().any(|s| plan.includes(*s)) {
        let key = require_api_key(&config.transform.api_key_env)?;
        services.transform = Some(Arc::new(OpenRouterService::new(
            &config.transform,
            key,
            timeout,
        )?));
    }

    if plan.includes(StageName::Deliver) {
        let key = require_api_key(&config.delivery.api_key_env)?;
        services.delivery = Some(Arc::new(BrevoDelivery::new(
            &config.delivery,
            key,
            timeout,
        )?));
    }

    let ledger_path = config.run.ledger_path();
    match Storage::open(&ledger_path).await {
        Ok(storage) => services.ledger = Some(Arc::new(storage)),
        Err(e) => warn!(path = %ledger_path.display(), error = %e, "run ledger unavailable, continuing without it"),
    }

    Ok(services)
}

fn print_run(run: &PipelineRun, output_dir: &Path) {
    println!();
    println!("  Run:     {}", run.run_id);
    println!("  Status:  {}", run.status);
    for stage in &run.stages_completed {
        let stats = run.stats.get(stage).cloned().unwrap_or_default();
        println!(
            "  {:<10} in {:>4}  out {:>4}  dropped {:>3}  filtered {:>3}",
            stage.as_str(),
            stats.input,
            stats.output,
            stats.dropped,
            stats.filtered
        );
    }
    if !run.diagnostics.is_empty() {
        println!("  Issues:  {}", run.diagnostics.len());
        for d in run.diagnostics.iter().take(10) {
            let subject = d.entity.as_deref().unwrap_or("-");
            println!("    [{}] {} {}: {}", d.stage, d.kind, subject, d.message);
        }
        if run.diagnostics.len() > 10 {
            println!("    ... {} more in run.json", run.diagnostics.len() - 10);
        }
    }
    println!("  Output:  {}", output_dir.display());
    println!();
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: Option<&Path>, output: Option<PathBuf>, history: u32) -> Result<()> {
    let mut config = resolve_config(config_path)?;
    if let Some(out) = output {
        config.run.output_dir = out.display().to_string();
    }

    let store = ArtifactStore::new(&config.run.output_dir);
    match store.load_run()? {
        Some(run) => print_run(&run, store.dir()),
        None => println!("No run recorded in {}", store.dir().display()),
    }

    for stage in StageName::ALL {
        let marker = if store.exists(stage) { "present" } else { "missing" };
        println!("  {:<24} {marker}", stage.artifact_file());
    }

    let ledger_path = config.run.ledger_path();
    if history > 0 && ledger_path.exists() {
        let ledger = Storage::open_readonly(&ledger_path).await?;
        let runs = ledger.list_runs(history).await?;
        if !runs.is_empty() {
            println!();
            println!("  Recent runs:");
            for (run_id, status, started_at) in runs {
                println!("    {started_at}  {run_id}  {status}");
            }
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// cache
// ---------------------------------------------------------------------------

/// Stages whose cache entries `cache clear` removes.
fn cache_stages(stage: Option<StageName>) -> Result<Vec<StageName>> {
    match stage {
        None => Ok(StageName::TRANSFORMS.to_vec()),
        Some(stage) if stage.is_transform() => Ok(vec![stage]),
        Some(stage) => Err(eyre!("stage {stage} has no transform cache")),
    }
}

async fn cmd_cache_clear(config_path: Option<&Path>, stage: Option<StageName>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let stages = cache_stages(stage)?;

    let ledger_path = config.run.ledger_path();
    if !ledger_path.exists() {
        println!("No ledger at {}, nothing to clear", ledger_path.display());
        return Ok(());
    }
    let ledger = Storage::open(&ledger_path).await?;
    for stage in stages {
        let removed = ledger.invalidate_transform_cache(stage.as_str()).await?;
        info!(%stage, removed, "cleared transform cache");
        println!("  {:<10} {removed} cached results removed", stage.as_str());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// entities
// ---------------------------------------------------------------------------

fn cmd_entities_check(config_path: Option<&Path>, entities: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let path = entities.unwrap_or_else(|| PathBuf::from(&config.run.entities_path));
    let list = load_entities(&path)?;
    let template = QueryTemplate::new(config.search.query_template.clone())?;

    println!("{} entities in {}", list.len(), path.display());
    for entity in &list {
        println!("  {:<32} {}", entity.name, template.render(entity));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, stage: StageName) {
        self.spinner.set_message(format!("Stage: {stage}"));
    }

    fn entity_searched(&self, entity: &str, ok: bool, current: usize, total: usize) {
        let mark = if ok { "ok" } else { "failed" };
        self.spinner
            .set_message(format!("Searching [{current}/{total}] {entity} ({mark})"));
    }

    fn item_processed(&self, stage: StageName, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Stage {stage} [{current}/{total}]"));
    }

    fn done(&self, _run: &PipelineRun) {
        self.spinner.finish_and_clear();
    }
}
