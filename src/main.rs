use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use surveyor::config::SurveyorConfig;
use surveyor::store::RunDb;

#[derive(Parser)]
#[command(name = "surveyor")]
#[command(version, about = "PR analysis orchestrator - fast scans and supervised plan runs")]
pub struct Cli {
    /// Directory holding surveyor.toml and local state (defaults to cwd)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the webhook intake server
    Serve {
        /// Port to listen on (overrides surveyor.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS for local dashboards)
        #[arg(long)]
        dev: bool,
    },
    /// Write a starter surveyor.toml and initialize the run database
    Init,
    /// List recorded runs, newest first
    Runs {
        /// Filter to one repository ("owner/repo"); requires --pr
        #[arg(long)]
        repository: Option<String>,

        /// Filter to one pull request number; requires --repository
        #[arg(long)]
        pr: Option<i64>,

        /// Maximum rows to print
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn init_logging(json: bool) {
    // Fall back to `default_level` if RUST_LOG is unset or invalid
    let default_level = "info";
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    if json {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

/// Anchor relative state paths at the config directory so `serve` and
/// `runs` agree on locations regardless of the invocation cwd.
fn resolve_paths(config: &mut SurveyorConfig, dir: &Path) {
    if config.store.db_path.is_relative() {
        config.store.db_path = dir.join(&config.store.db_path);
    }
    if config.artifacts.root.is_relative() {
        config.artifacts.root = dir.join(&config.artifacts.root);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config_dir = match cli.config_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve { port, dev } => cmd_serve(&config_dir, *port, *dev).await?,
        Commands::Init => cmd_init(&config_dir)?,
        Commands::Runs {
            repository,
            pr,
            limit,
        } => cmd_runs(&config_dir, repository.clone(), *pr, *limit)?,
    }

    Ok(())
}

async fn cmd_serve(config_dir: &Path, port: Option<u16>, dev: bool) -> Result<()> {
    let mut config = SurveyorConfig::load_or_default(config_dir)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if dev {
        config.server.dev = true;
    }
    resolve_paths(&mut config, config_dir);
    surveyor::server::start_server(config).await
}

fn cmd_init(config_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let config_path = config_dir.join("surveyor.toml");
    if config_path.exists() {
        println!("surveyor.toml already exists at {}", config_path.display());
    } else {
        std::fs::write(&config_path, SurveyorConfig::default_toml())
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote starter config to {}", config_path.display());
    }

    let mut config = SurveyorConfig::load(&config_path)?;
    resolve_paths(&mut config, config_dir);
    if let Some(parent) = config.store.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    RunDb::new(&config.store.db_path)?;
    std::fs::create_dir_all(&config.artifacts.root)?;
    println!(
        "Run database initialized at {}",
        config.store.db_path.display()
    );
    println!(
        "Artifacts will be stored under {}",
        config.artifacts.root.display()
    );
    Ok(())
}

fn cmd_runs(
    config_dir: &Path,
    repository: Option<String>,
    pr: Option<i64>,
    limit: usize,
) -> Result<()> {
    let filter = match (repository, pr) {
        (Some(repo), Some(pr)) => Some((repo, pr)),
        (None, None) => None,
        _ => anyhow::bail!("--repository and --pr must be supplied together"),
    };

    let mut config = SurveyorConfig::load_or_default(config_dir)?;
    resolve_paths(&mut config, config_dir);
    if !config.store.db_path.exists() {
        println!(
            "No run database at {} (run `surveyor init` first)",
            config.store.db_path.display()
        );
        return Ok(());
    }

    let db = RunDb::new(&config.store.db_path)?;
    let runs = db.list_runs(filter, limit)?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    for run in runs {
        let duration = run
            .duration_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        let mut line = format!(
            "{}  {:<12} {:<5} {:>8}  {}",
            run.created_at,
            run.status.as_str(),
            run.run_type.as_str(),
            duration,
            run.identity(),
        );
        if run.partial {
            line.push_str("  [partial]");
        }
        if let Some(error) = &run.error {
            line.push_str(&format!("  ({error})"));
        }
        println!("{line}");
    }
    Ok(())
}
