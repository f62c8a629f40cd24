use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::db::Store;
use crate::enrich::{EnrichRequest, EnrichmentSource, Outcome, Poller};
use crate::model::{ComplianceStatus, MonitoredListing};
use crate::resolve::ListingCode;
use crate::workflow;

/// Refresh stats returned after completion.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub total: usize,
    pub updated: usize,
    pub below_minimum: usize,
    pub no_data: usize,
    pub errors: usize,
}

struct Fetched {
    listing: MonitoredListing,
    outcome: Outcome,
}

/// Re-enrich listings concurrently, saving each new price as it arrives.
pub async fn refresh_listings<S>(
    store: &Store,
    poller: Arc<Poller<S>>,
    listings: Vec<MonitoredListing>,
    concurrency: usize,
) -> Result<RefreshStats>
where
    S: EnrichmentSource + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut stats = RefreshStats::default();

    // Listings without a usable code cannot be enriched.
    let targets: Vec<(MonitoredListing, ListingCode)> = listings
        .into_iter()
        .filter_map(|l| {
            let code = l.code.as_deref().and_then(ListingCode::normalize)?;
            Some((l, code))
        })
        .collect();
    stats.total = targets.len();

    let pb = ProgressBar::new(stats.total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Fetched>(concurrency.max(1) * 2);

    for (listing, code) in targets {
        let poller = Arc::clone(&poller);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let mut request = EnrichRequest::new(code);
            request.url = Some(listing.url.clone());
            let outcome = poller.enrich(&request).await;
            let _ = tx.send(Fetched { listing, outcome }).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    while let Some(Fetched { listing, outcome }) = rx.recv().await {
        pb.inc(1);
        let price = match outcome.snapshot().and_then(|s| s.price) {
            Some(price) => price,
            None => {
                if let Outcome::Failed(e) = &outcome {
                    warn!(id = listing.id, error = %e, "refresh fetch failed");
                    stats.errors += 1;
                } else {
                    stats.no_data += 1;
                }
                continue;
            }
        };

        match workflow::record_enriched_price(store, &listing, price) {
            Ok(compliance) => {
                stats.updated += 1;
                if compliance.status == ComplianceStatus::BelowMinimum {
                    stats.below_minimum += 1;
                }
            }
            Err(e) => {
                warn!(id = listing.id, error = %e, "could not save refreshed price");
                stats.errors += 1;
            }
        }
    }

    pb.finish_and_clear();
    info!(
        total = stats.total,
        updated = stats.updated,
        below_minimum = stats.below_minimum,
        errors = stats.errors,
        "refresh finished"
    );
    Ok(stats)
}
