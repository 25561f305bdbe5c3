use std::path::PathBuf;

use clap::{Parser, Subcommand};
use italia_opendata::config::{ENV_CACHE_DIR, ENV_LIST_LIMIT, ENV_MAX_AGE_DAYS, max_age_from_days};
use italia_opendata::logging::init_logging;
use italia_opendata::{Config, DatasetManager, Result};
use serde::Serialize;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    init_logging(&cli.log)?;
    let manager = DatasetManager::with_http(cli.config())?;

    match cli.command {
        Command::Regions => print_json(&manager.list_regions().await?),
        Command::Provinces { region } => {
            print_json(&manager.list_provinces(region.as_deref()).await?)
        }
        Command::Municipalities {
            region,
            province,
            limit,
        } => print_json(
            &manager
                .list_municipalities(region.as_deref(), province.as_deref(), limit)
                .await?,
        ),
        Command::Municipality { query } => print_json(&manager.get_municipality(&query).await?),
        Command::Cap { code } => print_json(&manager.get_by_postal_code(&code).await?),
        Command::Refresh { force } => print_json(&manager.refresh_dataset(force).await?),
        Command::Status => print_json(&manager.datasets_status().await),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Look up Italian regions, provinces and municipalities from a local open-data cache."
)]
struct Cli {
    /// Directory holding the local store.
    #[arg(long, global = true, env = ENV_CACHE_DIR)]
    cache_dir: Option<PathBuf>,

    /// Age in days after which the store is considered stale.
    #[arg(long, global = true, env = ENV_MAX_AGE_DAYS)]
    max_age_days: Option<u64>,

    /// Default cap on municipality listings.
    #[arg(long, global = true, env = ENV_LIST_LIMIT)]
    list_limit: Option<usize>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::from_env();
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(days) = self.max_age_days {
            config.max_age = max_age_from_days(days);
        }
        if let Some(limit) = self.list_limit {
            config.list_limit = limit;
        }
        config
    }
}

#[derive(Subcommand)]
enum Command {
    /// List every region with municipality count and population.
    Regions,
    /// List provinces, optionally within one region.
    Provinces {
        /// Region name or code.
        #[arg(long)]
        region: Option<String>,
    },
    /// List municipalities sorted by name.
    Municipalities {
        /// Region name or code.
        #[arg(long)]
        region: Option<String>,
        /// Province name, code or abbreviation.
        #[arg(long)]
        province: Option<String>,
        /// Maximum number of entries.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Look a municipality up by ISTAT code or name.
    Municipality {
        query: String,
    },
    /// List the municipalities served by a postal code.
    Cap {
        code: String,
    },
    /// Rebuild the local store from the sources.
    Refresh {
        /// Rebuild even when the store is fresh.
        #[arg(long)]
        force: bool,
    },
    /// Show store freshness and per-source sync state.
    Status,
}
