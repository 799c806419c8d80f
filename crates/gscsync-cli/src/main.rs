use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use gscsync_adapters::PropertySchema;
use gscsync_core::{DimensionFilters, WindowRequest};
use gscsync_sync::{
    list_sites_from_env, load_property_schema, run_sync_once_from_env, CancelFlag, SyncConfig,
    DEFAULT_DAYS_BACK, DEFAULT_LAG_DAYS, DEFAULT_WRITE_RATE_PER_SEC,
};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gscsync")]
#[command(about = "Copy Search Console analytics rows into a Notion database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync over the configured window.
    Sync(SyncArgs),
    /// List the Search Console properties the credentials can read.
    Sites,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, env = "GSC_SITE_URL")]
    site_url: String,
    /// First day, YYYY-MM-DD. Requires --end and overrides --days-back.
    #[arg(long)]
    start: Option<String>,
    /// Last day, YYYY-MM-DD.
    #[arg(long)]
    end: Option<String>,
    #[arg(long, default_value_t = DEFAULT_DAYS_BACK)]
    days_back: u32,
    #[arg(long, default_value_t = DEFAULT_LAG_DAYS)]
    lag_days: u32,
    #[arg(long, default_value_t = gscsync_adapters::MAX_ROW_LIMIT)]
    row_limit: u32,
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    device: Option<String>,
    /// Destination requests per second.
    #[arg(long, env = "NOTION_RATE_LIMIT_PER_SEC", default_value_t = DEFAULT_WRITE_RATE_PER_SEC)]
    write_rate: f64,
    /// YAML file mapping fields to destination property names.
    #[arg(long, env = "GSCSYNC_PROPERTY_SCHEMA")]
    schema: Option<PathBuf>,
    #[arg(long, env = "GSCSYNC_REPORTS_DIR")]
    reports_dir: Option<PathBuf>,
}

impl SyncArgs {
    fn into_config(self) -> SyncConfig {
        SyncConfig {
            site_url: self.site_url,
            window: WindowRequest {
                start: self.start,
                end: self.end,
                days_back: Some(self.days_back),
                lag_days: self.lag_days,
            },
            filters: DimensionFilters {
                country: self.country,
                device: self.device,
            },
            row_limit: self.row_limit,
            write_rate_per_sec: self.write_rate,
            reports_dir: self.reports_dir,
            ..SyncConfig::default()
        }
    }
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => {
            let schema = match &args.schema {
                Some(path) => load_property_schema(path)?,
                None => PropertySchema::default(),
            };

            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping before the next row");
                    on_signal.cancel();
                }
            });

            let report = run_sync_once_from_env(args.into_config(), schema, cancel).await?;
            let window = report
                .window
                .map(|w| w.to_string())
                .unwrap_or_else(|| "n/a".to_string());
            println!(
                "sync {:?}: run_id={} window={} created={} updated={} failed={} requests={} throttle_retries={}",
                report.state,
                report.run_id,
                window,
                report.created,
                report.updated,
                report.failed(),
                report.destination_requests,
                report.throttle_retries,
            );
            if let Some(err) = &report.fatal {
                eprintln!("error: {err}");
            }
            for failure in &report.failures {
                eprintln!(
                    "row failed: {} ({}, {} attempt(s)): {}",
                    failure.key, failure.operation, failure.attempts, failure.message
                );
            }

            let code = report.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Sites => {
            for site in list_sites_from_env().await? {
                println!("{} | {}", site.permission_level, site.site_url);
            }
        }
    }

    Ok(())
}
