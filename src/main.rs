mod analysis;
mod config;
mod console;
mod delivery;
mod error;
mod models;
mod scraper;
mod seen;
mod stats;
mod storage;
mod utils;
mod watcher;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::analysis::{Analyzer, OpenAiAnalyzer, format_analysis};
use crate::config::AppConfig;
use crate::console::{Console, ConsoleCommand, HELP, parse_command};
use crate::delivery::{
    Delivery, FanoutDelivery, LogDelivery, TsvLogDelivery, WebhookDelivery, format_listing,
};
use crate::models::ScopeId;
use crate::scraper::{ListingSource, ScrapingSource, candidate_for_url};
use crate::seen::{SeenSet, SeenStore, TtlPolicy};
use crate::storage::Repository;
use crate::watcher::catalog::CatalogStore;
use crate::watcher::cycle::{CycleParams, run_cycle};
use crate::watcher::{WatcherContext, registry};

#[derive(Parser)]
#[command(
    name = "listing-watcher",
    about = "Watches real-estate searches and reports new listings",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run every catalogued watcher and read operator commands from stdin
    Run,

    /// Preview the newest listings of a search without touching any seen-set
    Once {
        url: String,
        /// How many listings to fetch in detail
        #[arg(short, long, default_value_t = 10)]
        take: usize,
    },

    /// AI commentary for one listing detail page
    Analyze { url: String },

    /// Show the persisted watcher catalog
    List,

    /// Database totals, or price statistics for one scope's log
    Stats {
        #[arg(short, long)]
        scope: Option<String>,
        /// Only the last N logged listings
        #[arg(short, long)]
        last: Option<usize>,
    },

    /// Apply schema migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "listing_watcher=info,warn",
        1 => "listing_watcher=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(filter)
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run => run(config).await?,

        Command::Once { url, take } => {
            let _t = utils::Timer::start("One-shot preview");
            let source = ScrapingSource::from_config(&config.scraper, &config.watcher)?;
            let params = CycleParams {
                url: &url,
                scan_limit: config.watcher.scan_limit,
                take_limit: take,
                ttl: TtlPolicy::Never,
                now: utils::unix_now(),
            };
            let outcome = run_cycle(&source, &SeenSet::new(), &params).await?;
            for record in &outcome.emitted {
                println!("{}", format_listing(record));
            }
            println!(
                "{} listings on the page, {} shown, {} skipped",
                outcome.total_found,
                outcome.emitted.len(),
                outcome.skipped
            );
        }

        Command::Analyze { url } => {
            let analyzer = OpenAiAnalyzer::new(&config.analysis)?;
            let source = ScrapingSource::from_config(&config.scraper, &config.watcher)?;
            let record = source.detail(&candidate_for_url(&url)?).await?;
            let result = analyzer.analyze(&record).await?;
            println!("{}", format_analysis(&result, &record));
        }

        Command::List => {
            let configs = CatalogStore::new(&config.storage.catalog_path).load()?;
            let seen = SeenStore::new(&config.storage.seen_dir);
            if configs.is_empty() {
                println!(
                    "No watchers. Add one from `listing-watcher run` with `add <name> <url>`."
                );
            }
            for c in &configs {
                let size = seen
                    .persisted_len(&c.scope)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".into());
                println!(
                    "{:<16} every {:>5}s  {} seen  scope {}  {}",
                    c.name,
                    c.interval.as_secs(),
                    size,
                    c.scope,
                    c.url
                );
            }
        }

        Command::Stats { scope: Some(scope), last } => {
            let scope = ScopeId::new(&scope)?;
            let path = TsvLogDelivery::path_for(&config.storage.log_dir, &scope);
            let rows = stats::read_log(&path)?;
            let rows = match last {
                Some(n) => stats::last(&rows, n),
                None => &rows[..],
            };
            println!("─────────────────────────────────");
            println!("{}", stats::format_summary(scope.as_str(), &stats::summarize(rows)));
            println!("─────────────────────────────────");
        }

        Command::Stats { scope: None, .. } => {
            let repo = Repository::open(&config.storage.db_path)?;
            repo.run_migrations()?;
            println!("─────────────────────────────────");
            println!("  Listing Watcher Database Stats");
            println!("─────────────────────────────────");
            println!("  Listings : {}", utils::fmt_number(repo.listing_count()?));
            println!("  Cycles   : {}", utils::fmt_number(repo.cycle_run_count()?));
            for (watcher, n) in repo.counts_by_watcher()? {
                println!("  {:<9}: {}", watcher, utils::fmt_number(n));
            }
            println!("─────────────────────────────────");
            for l in repo.recent_listings(5)? {
                println!("  {}  [{}] {}  {}", l.first_seen_at, l.watcher, l.title, l.url);
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

fn build_delivery(config: &AppConfig) -> Result<Arc<dyn Delivery>> {
    let mut sinks: Vec<Arc<dyn Delivery>> = vec![Arc::new(LogDelivery)];
    if config.delivery.tsv_log {
        sinks.push(Arc::new(TsvLogDelivery::new(&config.storage.log_dir)));
    }
    if config.delivery.duckdb {
        let repo = Repository::open(&config.storage.db_path)?;
        if config.storage.run_migrations {
            repo.run_migrations()?;
        }
        sinks.push(Arc::new(repo));
    }
    if let Some(url) = &config.delivery.webhook_url {
        let timeout = std::time::Duration::from_secs(config.delivery.timeout_secs);
        sinks.push(Arc::new(WebhookDelivery::new(url, timeout)?));
    }
    let fanout = FanoutDelivery::new(sinks);
    info!("Delivering to {} sinks", fanout.len());
    Ok(Arc::new(fanout))
}

async fn run(config: AppConfig) -> Result<()> {
    let source: Arc<dyn ListingSource> =
        Arc::new(ScrapingSource::from_config(&config.scraper, &config.watcher)?);
    let analyzer: Option<Arc<dyn Analyzer>> = match OpenAiAnalyzer::new(&config.analysis) {
        Ok(a) => Some(Arc::new(a)),
        Err(e) => {
            info!("AI analysis disabled: {}", e);
            None
        }
    };

    let ctx = WatcherContext {
        source: source.clone(),
        delivery: build_delivery(&config)?,
        store: SeenStore::new(&config.storage.seen_dir),
        defaults: config.watcher.clone(),
    };
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let registry = registry::start(ctx, CatalogStore::new(&config.storage.catalog_path), reports_tx)
        .context("Failed to start watchers")?;
    let console = Console::new(
        registry.clone(),
        source,
        analyzer,
        config.storage.log_dir.clone(),
    );

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("stdin closed; running until Ctrl-C");
                        stdin_open = false;
                        continue;
                    }
                    Err(e) => {
                        warn!("stdin: {}", e);
                        stdin_open = false;
                        continue;
                    }
                };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => match console.execute(command).await {
                        Ok(reply) => println!("{}", reply),
                        Err(e) => println!("error: {}", e),
                    },
                    Err(e) => println!("{}", e),
                }
            }
            Some(failure) = reports.recv() => {
                println!("Watcher `{}` stopped: {}", failure.name, failure.error);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    let _t = utils::Timer::start("Shutdown");
    if let Err(e) = registry.shutdown().await {
        error!("Shutdown: {}", e);
    }
    Ok(())
}
