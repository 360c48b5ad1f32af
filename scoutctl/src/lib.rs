use std::fmt;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use scout_core::config::ScoutConfig;
use scout_core::load_scout_config;

pub mod commands;

use commands::artifacts::ArtifactArgs;
use commands::checkpoint::CheckpointCommands;
use commands::crawl::CrawlArgs;
use commands::score::ScoreArgs;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] scout_core::error::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue error: {0}")]
    Queue(#[from] scout_core::queue::QueueError),
    #[error("artifact error: {0}")]
    Artifact(#[from] scout_core::artifact::ArtifactError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] scout_core::telemetry::TelemetryError),
    #[error("crawl failed: {0}")]
    Runner(#[from] scout_core::runner::RunnerError),
    #[error("browser error: {0}")]
    Browser(#[from] scout_core::browser::BrowserError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Web-app crawl engine control interface", long_about = None)]
pub struct Cli {
    /// Path to the main scout.toml
    #[arg(long, default_value = "configs/scout.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a crawl against the configured application
    Crawl(CrawlArgs),
    /// Inspect or clear the persisted crawl checkpoint
    #[command(subcommand)]
    Checkpoint(CheckpointCommands),
    /// List stored page artifacts
    Artifacts(ArtifactArgs),
    /// Re-score stored artifacts offline from their recorded signals
    Score(ScoreArgs),
    /// Show aggregated run telemetry
    Status,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();

    match &cli.command {
        Commands::Crawl(args) => {
            let config = load_config_or_minimal(&cli, args.url.as_deref())?;
            let summary = commands::crawl::exec(config, args)?;
            render(&summary, cli.format)?;
        }
        Commands::Checkpoint(command) => {
            let config = load_config(&cli)?;
            let report = commands::checkpoint::exec(&config, command)?;
            render(&report, cli.format)?;
        }
        Commands::Artifacts(args) => {
            let config = load_config(&cli)?;
            let listing = commands::artifacts::exec(&config, args)?;
            render(&listing, cli.format)?;
        }
        Commands::Score(args) => {
            let config = load_config(&cli)?;
            let report = commands::score::exec(&config, args)?;
            render(&report, cli.format)?;
        }
        Commands::Status => {
            let config = load_config(&cli)?;
            let telemetry = scout_core::CrawlTelemetry::open(&config)?;
            let summary = StatusReport(telemetry.summary()?);
            render(&summary, cli.format)?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "scoutctl",
                &mut std::io::stdout(),
            );
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<ScoutConfig> {
    Ok(load_scout_config(&cli.config)?)
}

/// The crawl command can run without a config file when a start URL is
/// given on the command line.
fn load_config_or_minimal(cli: &Cli, url: Option<&str>) -> Result<ScoutConfig> {
    match load_scout_config(&cli.config) {
        Ok(config) => Ok(config),
        Err(scout_core::error::ConfigError::Io { .. }) => match url {
            Some(url) => Ok(ScoutConfig::for_url(url)),
            None => Err(AppError::MissingResource(format!(
                "config file {} not found and no --url given",
                cli.config.display()
            ))),
        },
        Err(err) => Err(err.into()),
    }
}

fn render<T: Serialize + fmt::Display>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{value}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct StatusReport(pub scout_core::TelemetrySummary);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_with_config(path: PathBuf) -> Cli {
        Cli::parse_from(["scoutctl", "--config", path.to_str().unwrap(), "status"])
    }

    #[test]
    fn config_file_is_loaded_when_present() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scout.toml");
        std::fs::write(&path, "[crawl]\nstart_url = \"https://x.com/app\"\n").unwrap();

        let cli = cli_with_config(path);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.crawl.start_url, "https://x.com/app");
    }

    #[test]
    fn missing_config_falls_back_to_url() {
        let dir = TempDir::new().unwrap();
        let cli = cli_with_config(dir.path().join("absent.toml"));
        let config = load_config_or_minimal(&cli, Some("https://y.com/app")).unwrap();
        assert_eq!(config.crawl.start_url, "https://y.com/app");
    }

    #[test]
    fn missing_config_without_url_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cli = cli_with_config(dir.path().join("absent.toml"));
        let err = load_config_or_minimal(&cli, None).unwrap_err();
        assert!(matches!(err, AppError::MissingResource(_)));
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pages ok:          {}", self.0.pages_ok)?;
        writeln!(f, "pages failed:      {}", self.0.pages_failed)?;
        writeln!(f, "failures logged:   {}", self.0.failures)?;
        writeln!(f, "rate-limit events: {}", self.0.rate_limit_events)?;
        match self.0.average_score {
            Some(score) => write!(f, "average score:     {score:.1}"),
            None => write!(f, "average score:     n/a"),
        }
    }
}
