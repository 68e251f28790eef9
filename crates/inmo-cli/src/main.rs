use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use inmo_adapters::AdapterSettings;
use inmo_core::CrawlMode;
use inmo_sync::{dataset_status, load_source_registry, CrawlConfig, RunDriver};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "inmo")]
#[command(about = "Incremental listing crawler and reconciliation engine")]
struct Cli {
    /// Directory holding the dataset, registry and checkpoint files.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Source registry file.
    #[arg(long, global = true)]
    sources: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled source and reconcile the dataset.
    Run(RunArgs),
    /// Show dataset and registry counts.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List configured sources.
    Sources,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// incremental | full
    #[arg(long)]
    mode: Option<CrawlMode>,
    /// Maximum detail fetches per source.
    #[arg(long)]
    cap: Option<usize>,
    #[arg(long)]
    group_by_source: bool,
    #[arg(long)]
    no_robots: bool,
}

fn load_config(cli: &Cli) -> Result<CrawlConfig> {
    CrawlConfig::from_lookup(|key| match key {
        "DATA_DIR" if cli.data_dir.is_some() => {
            cli.data_dir.as_ref().map(|p| p.display().to_string())
        }
        "SOURCES_FILE" if cli.sources.is_some() => {
            cli.sources.as_ref().map(|p| p.display().to_string())
        }
        _ => std::env::var(key).ok(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            if let Some(mode) = args.mode {
                config.mode = mode;
            }
            if args.cap.is_some() {
                config.item_cap = args.cap;
            }
            config.group_by_source |= args.group_by_source;
            config.respect_robots &= !args.no_robots;

            let summary = RunDriver::new(config)?.run().await?;
            println!(
                "run complete: mode={} sources={} new={} changed={} removed={} failed={} records={}",
                summary.mode,
                summary.sources.len(),
                summary.totals.new,
                summary.totals.changed,
                summary.totals.removed,
                summary.totals.failed,
                summary.final_records
            );
            if !summary.failed_sources.is_empty() {
                eprintln!("sources with errors: {}", summary.failed_sources.join(", "));
            }
        }
        Commands::Status { json } => {
            let status = dataset_status(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "dataset: {} ({} records, {} removed, {} sources)",
                    config.listings_file.display(),
                    status.records,
                    status.removed_records,
                    status.sources
                );
                println!(
                    "registry: {} active, {} removed",
                    status.registry_active, status.registry_removed
                );
                let fmt_ts = |ts: Option<DateTime<Utc>>| {
                    ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
                };
                println!("last full run: {}", fmt_ts(status.last_full_run));
                println!("last incremental scan: {}", fmt_ts(status.last_incremental_scan));
                if status.checkpoint_pending {
                    println!(
                        "checkpoint pending: {} (previous run was interrupted)",
                        config.checkpoint_file.display()
                    );
                }
            }
        }
        Commands::Sources => {
            let registry = load_source_registry(&config.sources_file).await?;
            for source in &registry.sources {
                let kind = match &source.adapter {
                    AdapterSettings::Fixture { path } => format!("fixture {}", path.display()),
                    AdapterSettings::Selector(cfg) => match &cfg.sitemap_url {
                        Some(sitemap) => format!("selector sitemap={sitemap}"),
                        None => format!("selector pages={}", cfg.listing_urls.len()),
                    },
                };
                let state = if source.enabled { "enabled" } else { "disabled" };
                println!("{:<24} {:<9} {}", source.name, state, kind);
            }
        }
    }

    Ok(())
}
