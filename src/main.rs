mod crawler;
mod error;
mod export;
mod model;
mod parser;
mod render;
mod retry;
mod scheduler;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use crate::crawler::{CrawlOptions, PaginationController};
use crate::model::{ProductLink, ProductRecord, SealedFrontier};
use crate::parser::PageSelectors;
use crate::render::ChromeRenderer;
use crate::scheduler::{FetchScheduler, ScheduleOptions};
use crate::settings::{FailurePolicy, Settings};

#[derive(Parser)]
#[command(name = "nutri_scraper", about = "Catalog crawler and nutrition table scraper")]
struct Cli {
    /// TOML settings file (NUTRI_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CrawlArgs {
    /// Catalog entry URL
    #[arg(long)]
    url: Option<String>,
    /// Max catalog pages to visit
    #[arg(long)]
    max_pages: Option<usize>,
}

impl CrawlArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.url {
            settings.category_url = url.clone();
        }
        if let Some(n) = self.max_pages {
            settings.max_pages = n;
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Product pages fetched at the same time
    #[arg(long)]
    concurrency: Option<usize>,
    /// Minimum milliseconds between product fetches
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Max products to scrape (default: all discovered)
    #[arg(short = 'n', long)]
    max_records: Option<usize>,
    /// Leave failed products out instead of reporting them
    #[arg(long)]
    drop_failures: bool,
    /// Write records as JSON to this file
    #[arg(long)]
    json: Option<PathBuf>,
    /// Write the flattened table as CSV to this file
    #[arg(long)]
    csv: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(n) = self.concurrency {
            settings.concurrency_limit = n;
        }
        if let Some(ms) = self.delay_ms {
            settings.inter_request_delay_ms = ms;
        }
        if let Some(n) = self.max_records {
            settings.max_records = n;
        }
        if self.drop_failures {
            settings.failure_policy = FailurePolicy::Drop;
        }
        if let Some(path) = &self.json {
            settings.output.json_path = Some(path.clone());
        }
        if let Some(path) = &self.csv {
            settings.output.csv_path = path.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the catalog pages and collect product links
    Crawl {
        #[command(flatten)]
        crawl: CrawlArgs,
        /// Save links as JSON (default: print them)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Scrape products from a saved links file
    Scrape {
        /// JSON array of product URLs, as written by `crawl -o`
        #[arg(long)]
        links: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Crawl + scrape + export in one pipeline
    Run {
        #[command(flatten)]
        crawl: CrawlArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Scrape a single product page and print the record
    Product {
        url: String,
        /// Save a full-page screenshot here
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Turn a JSON records file into CSV
    Export {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        csv: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Crawl { crawl, output } => {
            crawl.apply(&mut settings);
            let selectors = settings.validate()?;
            let renderer = ChromeRenderer::new(settings.browser.clone());
            let frontier = crawl_catalog(&renderer, &settings, &selectors).await;
            renderer.shutdown().await;

            println!(
                "Found {} product links on {} pages ({}).",
                frontier.links.len(),
                frontier.pages,
                frontier.stop
            );
            match output {
                Some(path) => export::write_links(&frontier.links, &path),
                None => {
                    for link in &frontier.links {
                        println!("{}", link);
                    }
                    Ok(())
                }
            }
        }
        Commands::Scrape { links, run } => {
            run.apply(&mut settings);
            let selectors = settings.validate()?;
            let links = export::read_links(&links)?;
            if links.is_empty() {
                println!("No links in file, 0 records.");
                return Ok(());
            }
            let renderer = Arc::new(ChromeRenderer::new(settings.browser.clone()));
            let records = scrape_links(&renderer, &settings, selectors, links).await;
            renderer.shutdown().await;
            save_records(&records, &settings)
        }
        Commands::Run { crawl, run } => {
            crawl.apply(&mut settings);
            run.apply(&mut settings);
            let selectors = settings.validate()?;
            let renderer = Arc::new(ChromeRenderer::new(settings.browser.clone()));

            // Phase 1: Crawl
            let t_crawl = Instant::now();
            let frontier = crawl_catalog(renderer.as_ref(), &settings, &selectors).await;
            println!(
                "Crawled {} pages, {} product links ({}) in {:.1}s",
                frontier.pages,
                frontier.links.len(),
                frontier.stop,
                t_crawl.elapsed().as_secs_f64()
            );
            if frontier.links.is_empty() {
                renderer.shutdown().await;
                println!("Nothing to scrape, 0 records.");
                return Ok(());
            }

            // Phase 2: Scrape
            let records = scrape_links(&renderer, &settings, selectors, frontier.links).await;
            renderer.shutdown().await;
            save_records(&records, &settings)
        }
        Commands::Product { url, snapshot } => {
            let selectors = settings.validate()?;
            let renderer = Arc::new(ChromeRenderer::new(settings.browser.clone()));
            let scheduler = FetchScheduler::new(
                renderer.clone(),
                selectors,
                ScheduleOptions::from_settings(&settings),
            );
            let link = ProductLink::new(url);
            let record = scheduler
                .scrape_single(&link, snapshot.as_deref())
                .await
                .unwrap_or_else(|e| ProductRecord::failed(link.clone(), &e.source));
            renderer.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::Export { input, csv } => {
            let records = export::read_json(&input)?;
            if records.is_empty() {
                println!("No records in {}, 0 records.", input.display());
            }
            export::write_csv(&records, &csv)?;
            println!("Exported {} records to {}", records.len(), csv.display());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn crawl_catalog(
    renderer: &ChromeRenderer,
    settings: &Settings,
    selectors: &PageSelectors,
) -> SealedFrontier {
    let opts = CrawlOptions::from_settings(settings);
    PaginationController::new(renderer, &opts, selectors).run().await
}

async fn scrape_links(
    renderer: &Arc<ChromeRenderer>,
    settings: &Settings,
    selectors: PageSelectors,
    links: Vec<ProductLink>,
) -> Vec<ProductRecord> {
    let scheduler = FetchScheduler::new(
        renderer.clone(),
        selectors,
        ScheduleOptions::from_settings(settings),
    );
    let t_scrape = Instant::now();
    let (records, stats) = scheduler.run(links).await;
    println!(
        "Scraped {} products ({} ok, {} failed, {} dropped) in {:.1}s",
        stats.total,
        stats.ok,
        stats.failed,
        stats.dropped,
        t_scrape.elapsed().as_secs_f64()
    );
    records
}

fn save_records(records: &[ProductRecord], settings: &Settings) -> anyhow::Result<()> {
    if records.is_empty() {
        println!("0 records, nothing written.");
        return Ok(());
    }
    if let Some(path) = &settings.output.json_path {
        export::write_json(records, path)?;
    }
    export::write_csv(records, &settings.output.csv_path)?;
    println!(
        "Saved {} records to {}",
        records.len(),
        settings.output.csv_path.display()
    );
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
