mod compliance;
mod config;
mod db;
mod enrich;
mod error;
mod guard;
mod model;
mod refresh;
mod resolve;
mod session;
mod workflow;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::Settings;
use crate::db::Store;
use crate::enrich::{EnrichmentSource, NoticeLevel, Poller};
use crate::guard::Verdict;
use crate::model::{ComplaintStatus, ComplianceStatus, Id};
use crate::session::{EnrichmentState, Purpose, Resolution, ResolutionSession};
use crate::workflow::{CallbackOutcome, CallbackPayload, ComplaintDraft, ListingDraft};

#[derive(Parser)]
#[command(name = "floorwatch", about = "Track marketplace listings priced below the agreed minimum")]
struct Cli {
    /// SQLite database path (overrides FLOORWATCH_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Manage registered marketplaces
    Marketplace {
        #[command(subcommand)]
        action: MarketplaceCmd,
    },
    /// Manage products and their minimum prices
    Product {
        #[command(subcommand)]
        action: ProductCmd,
    },
    /// Detect marketplace, code, duplicates and live data for a URL
    Resolve {
        url: String,
        #[arg(long, value_enum, default_value = "listing")]
        purpose: PurposeArg,
    },
    /// Monitored listings
    Listing {
        #[command(subcommand)]
        action: ListingCmd,
    },
    /// Client complaints
    Complaint {
        #[command(subcommand)]
        action: ComplaintCmd,
    },
    /// Ingest a price callback (JSON) from a file or stdin
    Callback {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Re-fetch live prices for monitored listings
    Refresh {
        /// Max listings to refresh (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show counts
    Stats,
}

#[derive(Subcommand)]
enum MarketplaceCmd {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
    },
    List {
        /// Include inactive marketplaces
        #[arg(long)]
        all: bool,
    },
    Activate { id: Id },
    Deactivate { id: Id },
}

#[derive(Subcommand)]
enum ProductCmd {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        sku: String,
        #[arg(long)]
        min_price: Decimal,
    },
    List {
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum ListingCmd {
    /// Start monitoring a listing; the price is fetched when not given
    Add {
        #[arg(long)]
        url: String,
        #[arg(long)]
        product: Id,
        #[arg(long)]
        marketplace: Option<Id>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        price: Option<Decimal>,
    },
    List {
        /// Only listings below their minimum
        #[arg(long)]
        below: bool,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Set a new detected price
    Price { id: Id, price: Decimal },
}

#[derive(Subcommand)]
enum ComplaintCmd {
    Submit {
        #[arg(long)]
        client: Id,
        #[arg(long)]
        product: Id,
        #[arg(long)]
        url: String,
        #[arg(long)]
        price: Decimal,
        #[arg(long)]
        marketplace: Option<Id>,
        #[arg(long)]
        notes: Option<String>,
    },
    List {
        /// Only requested / in-progress
        #[arg(long)]
        open: bool,
    },
    /// Set lifecycle status (requested, in-progress, resolved)
    Status {
        id: Id,
        status: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Create a monitored listing from a resolved complaint
    Convert {
        id: Id,
        #[arg(long)]
        price: Option<Decimal>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PurposeArg {
    Listing,
    Complaint,
}

impl From<PurposeArg> for Purpose {
    fn from(p: PurposeArg) -> Self {
        match p {
            PurposeArg::Listing => Purpose::Listing,
            PurposeArg::Complaint => Purpose::Complaint,
        }
    }
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

    let mut settings = Settings::load().unwrap_or_else(|e| {
        warn!(error = %e, "could not load settings, using defaults");
        Settings::default()
    });
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if let Some(dir) = settings.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let store = Store::open(&settings.db_path)
        .with_context(|| format!("Failed to open {:?}", settings.db_path))?;

    let result = match cli.command {
        Commands::Init => {
            println!("Database ready at {:?}", settings.db_path);
            Ok(())
        }
        Commands::Marketplace { action } => run_marketplace(&store, action),
        Commands::Product { action } => run_product(&store, action),
        Commands::Resolve { url, purpose } => {
            let r = resolve_url(&store, &settings, purpose.into(), &url).await?;
            print_resolution(&r);
            Ok(())
        }
        Commands::Listing { action } => run_listing(&store, &settings, action).await,
        Commands::Complaint { action } => run_complaint(&store, action),
        Commands::Callback { file } => run_callback(&store, file),
        Commands::Refresh { limit } => {
            let listings = store.with_conn(|conn| db::list_listings(conn, None, limit))?;
            if listings.is_empty() {
                println!("No monitored listings.");
                return Ok(());
            }
            let poller = Arc::new(make_poller(&settings)?);
            println!("Refreshing {} listings...", listings.len());
            let stats =
                refresh::refresh_listings(&store, poller, listings, settings.refresh_concurrency).await?;
            println!(
                "Done: {} refreshed ({} updated, {} below minimum, {} without data, {} errors).",
                stats.total, stats.updated, stats.below_minimum, stats.no_data, stats.errors
            );
            Ok(())
        }
        Commands::Stats => {
            let s = store.with_conn(db::get_stats)?;
            println!("Marketplaces:    {}", s.marketplaces);
            println!("Products:        {}", s.products);
            println!("Listings:        {}", s.listings);
            println!("Below minimum:   {}", s.below_minimum);
            println!("Complaints:      {}", s.complaints);
            println!("Open complaints: {}", s.open_complaints);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {:.1}s", elapsed.as_secs_f64());
    }

    result
}

fn make_poller(settings: &Settings) -> anyhow::Result<Poller<Arc<dyn EnrichmentSource>>> {
    let source = enrich::source_from_settings(
        settings.enrich_endpoint.as_deref(),
        settings.enrich_token.clone(),
    )?;
    if settings.enrich_endpoint.is_none() {
        info!("FLOORWATCH_ENRICH_ENDPOINT not set, live data disabled");
    }
    Ok(Poller::new(source, settings.retry_delay()))
}

async fn resolve_url(
    store: &Store,
    settings: &Settings,
    purpose: Purpose,
    url: &str,
) -> anyhow::Result<Resolution> {
    let marketplaces = store.with_conn(|conn| db::list_marketplaces(conn, true))?;
    let mut session = ResolutionSession::new(purpose, marketplaces, store.clone(), make_poller(settings)?);

    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_message("Resolving listing...");
    spinner.enable_steady_tick(Duration::from_millis(120));
    session.set_url(url);
    let resolution = session.settled().await;
    spinner.finish_and_clear();
    Ok(resolution)
}

fn print_resolution(r: &Resolution) {
    if let Some(e) = &r.input_error {
        println!("Input error: {e}");
        return;
    }
    match &r.marketplace {
        Some(m) => println!("Marketplace: {} (#{})", m.name, m.id),
        None => println!("Marketplace: not detected"),
    }
    match &r.code {
        Some(c) => println!("Code:        {} ({})", c, c.family().as_str()),
        None => println!("Code:        not detected"),
    }
    match r.verdict() {
        Some(Verdict::Clear) => println!("Duplicate:   no"),
        Some(Verdict::Duplicate(reason)) => println!("Duplicate:   yes, {reason}"),
        Some(Verdict::Unverified(warning)) => println!("Duplicate:   unknown, {warning}"),
        None => println!("Duplicate:   not checked"),
    }
    if let EnrichmentState::Finished(outcome) = &r.enrichment {
        if let Some(s) = outcome.snapshot() {
            let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".into());
            println!("Title:       {}", show(&s.title));
            println!("Price:       {}", s.price.map(|p| p.to_string()).unwrap_or_else(|| "-".into()));
            println!("Full price:  {}", s.full_price.map(|p| p.to_string()).unwrap_or_else(|| "-".into()));
            println!("Discount:    {}", s.discount.map(|p| format!("{p}%")).unwrap_or_else(|| "-".into()));
            println!("Seller:      {}", show(&s.seller));
            println!("Sales:       {}", show(&s.sales));
            println!("Rating:      {}", show(&s.rating));
            println!("Image:       {}", show(&s.image));
        }
        if let Some(notice) = outcome.notice() {
            let label = match notice.level {
                NoticeLevel::Info => "Note:",
                NoticeLevel::Error => "Error:",
            };
            println!("{label:<12} {}", notice.message);
        }
    }
    println!("Can submit:  {}", if r.can_submit() { "yes" } else { "no" });
}

fn run_marketplace(store: &Store, action: MarketplaceCmd) -> anyhow::Result<()> {
    match action {
        MarketplaceCmd::Add { name, url } => {
            let id = workflow::add_marketplace(store, &name, &url)?;
            println!("Marketplace #{id} added.");
        }
        MarketplaceCmd::List { all } => {
            let rows = store.with_conn(|conn| db::list_marketplaces(conn, !all))?;
            println!("{:>4} | {:<24} | {:<40} | {:<6}", "#", "Name", "Base URL", "Active");
            println!("{}", "-".repeat(84));
            for m in &rows {
                println!(
                    "{:>4} | {:<24} | {:<40} | {:<6}",
                    m.id,
                    truncate(&m.name, 24),
                    truncate(&m.base_url, 40),
                    if m.active { "yes" } else { "no" }
                );
            }
        }
        MarketplaceCmd::Activate { id } => workflow::set_marketplace_active(store, id, true)?,
        MarketplaceCmd::Deactivate { id } => workflow::set_marketplace_active(store, id, false)?,
    }
    Ok(())
}

fn run_product(store: &Store, action: ProductCmd) -> anyhow::Result<()> {
    match action {
        ProductCmd::Add { name, sku, min_price } => {
            let id = workflow::add_product(store, &name, &sku, min_price)?;
            println!("Product #{id} added.");
        }
        ProductCmd::List { all } => {
            let rows = store.with_conn(|conn| db::list_products(conn, !all))?;
            println!("{:>4} | {:<32} | {:<16} | {:>12}", "#", "Name", "SKU", "Min price");
            println!("{}", "-".repeat(74));
            for p in &rows {
                println!(
                    "{:>4} | {:<32} | {:<16} | {:>12}",
                    p.id,
                    truncate(&p.name, 32),
                    truncate(&p.sku, 16),
                    p.min_price
                );
            }
        }
    }
    Ok(())
}

async fn run_listing(store: &Store, settings: &Settings, action: ListingCmd) -> anyhow::Result<()> {
    match action {
        ListingCmd::Add {
            url,
            product,
            marketplace,
            code,
            price,
        } => {
            let detected_price = match price {
                Some(p) => p,
                None => {
                    let r = resolve_url(store, settings, Purpose::Listing, &url).await?;
                    match r.snapshot().and_then(|s| s.price) {
                        Some(p) => {
                            println!("Detected price: {p}");
                            p
                        }
                        None => {
                            print_resolution(&r);
                            bail!("no live price available; pass --price");
                        }
                    }
                }
            };
            let draft = ListingDraft {
                url,
                product_id: product,
                marketplace_id: marketplace,
                code,
                client_id: None,
                detected_price,
            };
            let (submitted, compliance) = workflow::create_listing(store, &draft)?;
            if let Some(w) = submitted.warning {
                println!("Warning: {w}");
            }
            println!(
                "Listing #{} created: {} (gap {} / {}%).",
                submitted.id, compliance.status, compliance.gap_absolute, compliance.gap_percent
            );
        }
        ListingCmd::List { below, limit } => {
            let status = below.then_some(ComplianceStatus::BelowMinimum);
            let rows = store.with_conn(|conn| db::list_listings(conn, status, limit))?;
            if rows.is_empty() {
                println!("No listings found.");
                return Ok(());
            }
            println!(
                "{:>4} | {:<16} | {:>10} | {:>10} | {:<13} | {:<19} | {:<30}",
                "#", "Code", "Price", "Minimum", "Status", "Updated", "URL"
            );
            println!("{}", "-".repeat(118));
            for l in &rows {
                println!(
                    "{:>4} | {:<16} | {:>10} | {:>10} | {:<13} | {:<19} | {:<30}",
                    l.id,
                    l.code.as_deref().unwrap_or("-"),
                    l.detected_price,
                    l.min_price,
                    l.status,
                    l.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&l.url, 30)
                );
            }
            println!("\n{} listings", rows.len());
        }
        ListingCmd::Price { id, price } => {
            let c = workflow::update_listing_price(store, id, price)?;
            println!("Listing #{id}: {} (gap {} / {}%).", c.status, c.gap_absolute, c.gap_percent);
        }
    }
    Ok(())
}

fn run_complaint(store: &Store, action: ComplaintCmd) -> anyhow::Result<()> {
    match action {
        ComplaintCmd::Submit {
            client,
            product,
            url,
            price,
            marketplace,
            notes,
        } => {
            let draft = ComplaintDraft {
                client_id: client,
                product_id: product,
                marketplace_id: marketplace,
                url,
                reported_price: price,
                notes,
            };
            let submitted = workflow::submit_complaint(store, &draft)?;
            if let Some(w) = submitted.warning {
                println!("Warning: {w}");
            }
            println!("Complaint #{} submitted.", submitted.id);
        }
        ComplaintCmd::List { open } => {
            let rows = store.with_conn(|conn| db::list_complaints(conn, open))?;
            if rows.is_empty() {
                println!("No complaints found.");
                return Ok(());
            }
            println!(
                "{:>4} | {:>6} | {:>10} | {:<11} | {:<10} | {:<40}",
                "#", "Client", "Price", "Status", "Created", "URL"
            );
            println!("{}", "-".repeat(96));
            for c in &rows {
                println!(
                    "{:>4} | {:>6} | {:>10} | {:<11} | {:<10} | {:<40}",
                    c.id,
                    c.client_id,
                    c.reported_price,
                    c.status,
                    c.created_at.format("%Y-%m-%d"),
                    truncate(&c.url, 40)
                );
            }
        }
        ComplaintCmd::Status { id, status, comment } => {
            let status: ComplaintStatus = status.parse()?;
            workflow::update_complaint(store, id, status, comment.as_deref())?;
            println!("Complaint #{id} is now {status}.");
        }
        ComplaintCmd::Convert { id, price } => {
            let (submitted, compliance) = workflow::convert_complaint(store, id, price)?;
            if let Some(w) = submitted.warning {
                println!("Warning: {w}");
            }
            println!(
                "Complaint #{id} converted into listing #{} ({}).",
                submitted.id, compliance.status
            );
        }
    }
    Ok(())
}

fn run_callback(store: &Store, file: Option<PathBuf>) -> anyhow::Result<()> {
    let body = match &file {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read callback from stdin")?;
            buf
        }
    };
    let payload: CallbackPayload =
        serde_json::from_str(&body).context("Callback body is not a valid payload")?;

    match workflow::ingest_callback(store, &payload)? {
        CallbackOutcome::Updated(rows) => {
            for (id, c) in rows {
                println!("Listing #{id}: {} (gap {}%).", c.status, c.gap_percent);
            }
        }
        CallbackOutcome::NoPrice => println!("No price in callback; nothing updated."),
        CallbackOutcome::Unmatched => println!("No listing with code {}.", payload.code),
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}
