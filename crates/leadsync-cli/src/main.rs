use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use leadsync_core::{LeadSyncConfig, OutputFormat};
use leadsync_sync::RunOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Fetch Meta lead-form leads, drop ones seen in earlier runs, write the rest")]
struct Cli {
    /// ISO timestamp; only leads created after it are requested
    #[arg(long)]
    since: Option<String>,
    #[arg(long, value_enum, default_value_t = OutputArg::Json)]
    output: OutputArg,
    /// Seen-leads database path (defaults to DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,
    /// Write output but do not record leads as seen
    #[arg(long)]
    dry_run: bool,
    /// Stop after this many pages (at least 1)
    #[arg(long, value_parser = parse_max_pages)]
    max_pages: Option<usize>,
    /// Load leads from the sample fixture (SAMPLE_PATH) instead of the API
    #[arg(long)]
    mock_sample: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputArg {
    Json,
    Csv,
}

impl From<OutputArg> for OutputFormat {
    fn from(arg: OutputArg) -> Self {
        match arg {
            OutputArg::Json => OutputFormat::Json,
            OutputArg::Csv => OutputFormat::Csv,
        }
    }
}

fn parse_max_pages(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(pages) => Ok(pages),
        Err(err) => Err(err.to_string()),
    }
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            since: self.since.clone(),
            output: self.output.into(),
            db_path: self.db.clone(),
            dry_run: self.dry_run,
            max_pages: self.max_pages,
            mock_sample: self.mock_sample,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = LeadSyncConfig::from_env();

    if !cli.mock_sample {
        if let Err(err) = config.require_credentials() {
            error!(%err, "META_ACCESS_TOKEN and LEAD_FORM_ID must be set in .env or use --mock-sample");
            std::process::exit(1);
        }
    }

    let summary = leadsync_sync::run_once(&config, &cli.run_options()).await?;
    info!(
        run_id = %summary.run_id,
        source = summary.source.as_str(),
        total = summary.total_count,
        accepted = summary.accepted_count,
        output = summary.output_path.as_deref().unwrap_or("-"),
        "sync complete"
    );

    Ok(())
}
