use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::compliance::{evaluate, Compliance};
use crate::db::{self, Store};
use crate::error::SubmitError;
use crate::guard::{is_duplicate, DuplicateKey, Verdict};
use crate::model::*;
use crate::resolve::{extract_code, host_of, resolve_marketplace, ListingCode};

/// Result of a successful submission, with any warning raised on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub id: Id,
    pub warning: Option<String>,
}

fn parse_url(raw: &str) -> Result<String, SubmitError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(SubmitError::Input("URL is required".into()));
    }
    Url::parse(url).map_err(|e| SubmitError::Input(format!("not a valid URL ({e}): {url}")))?;
    Ok(url.to_string())
}

fn require_positive(label: &str, value: Decimal) -> Result<(), SubmitError> {
    if value <= Decimal::ZERO {
        return Err(SubmitError::Input(format!("{label} must be greater than zero")));
    }
    Ok(())
}

/// Turn a guard verdict into either a refusal or an optional warning.
fn gate(verdict: Verdict) -> Result<Option<String>, SubmitError> {
    match verdict {
        Verdict::Clear => Ok(None),
        Verdict::Duplicate(reason) => Err(SubmitError::Duplicate(reason)),
        Verdict::Unverified(warning) => Ok(Some(warning)),
    }
}

fn load_product(store: &Store, id: Id) -> Result<Product, SubmitError> {
    store
        .with_conn(|conn| db::get_product(conn, id))?
        .ok_or(SubmitError::NotFound { kind: "product", id })
}

/// Explicit marketplace id wins; otherwise detect it from the URL.
fn pick_marketplace(store: &Store, explicit: Option<Id>, url: &str) -> Result<Marketplace, SubmitError> {
    if let Some(id) = explicit {
        return store
            .with_conn(|conn| db::get_marketplace(conn, id))?
            .ok_or(SubmitError::NotFound { kind: "marketplace", id });
    }
    let marketplaces = store.with_conn(|conn| db::list_marketplaces(conn, true))?;
    resolve_marketplace(url, &marketplaces)
        .cloned()
        .ok_or_else(|| SubmitError::Input(format!("could not detect the marketplace of {url}")))
}

// ── Directory ──

pub fn add_marketplace(store: &Store, name: &str, base_url: &str) -> Result<Id, SubmitError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SubmitError::Input("marketplace name is required".into()));
    }
    if host_of(base_url).is_none() {
        return Err(SubmitError::Input(format!(
            "base URL must be an absolute URL with a host: {base_url}"
        )));
    }
    let id = store.with_conn(|conn| db::insert_marketplace(conn, name, base_url.trim()))?;
    info!(id, name, "marketplace added");
    Ok(id)
}

pub fn set_marketplace_active(store: &Store, id: Id, active: bool) -> Result<(), SubmitError> {
    if !store.with_conn(|conn| db::set_marketplace_active(conn, id, active))? {
        return Err(SubmitError::NotFound { kind: "marketplace", id });
    }
    info!(id, active, "marketplace updated");
    Ok(())
}

pub fn add_product(store: &Store, name: &str, sku: &str, min_price: Decimal) -> Result<Id, SubmitError> {
    let (name, sku) = (name.trim(), sku.trim());
    if name.is_empty() || sku.is_empty() {
        return Err(SubmitError::Input("product name and SKU are required".into()));
    }
    require_positive("minimum price", min_price)?;
    let id = store.with_conn(|conn| db::insert_product(conn, name, sku, min_price))?;
    info!(id, sku, %min_price, "product added");
    Ok(id)
}

// ── Listings ──

#[derive(Debug, Clone, Default)]
pub struct ListingDraft {
    pub url: String,
    pub product_id: Id,
    pub marketplace_id: Option<Id>,
    /// Overrides extraction; normalized before use.
    pub code: Option<String>,
    pub client_id: Option<Id>,
    pub detected_price: Decimal,
}

fn insert_evaluated_listing(
    store: &Store,
    draft: &ListingDraft,
    origin: Origin,
) -> Result<(Submitted, Compliance), SubmitError> {
    let url = parse_url(&draft.url)?;
    require_positive("detected price", draft.detected_price)?;
    let product = load_product(store, draft.product_id)?;
    let marketplace = pick_marketplace(store, draft.marketplace_id, &url)?;

    let code = match draft.code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            ListingCode::normalize(raw)
                .ok_or_else(|| SubmitError::Input(format!("unrecognized listing code: {raw}")))?,
        ),
        None => extract_code(&url, Some(&marketplace)),
    };

    let warning = match &code {
        Some(code) => gate(is_duplicate(store, &DuplicateKey::Code(code.clone())))?,
        None => None,
    };

    let compliance = evaluate(draft.detected_price, product.min_price)?;
    let listing = NewListing {
        url,
        code: code.map(|c| c.to_string()),
        product_id: product.id,
        marketplace_id: marketplace.id,
        client_id: draft.client_id,
        detected_price: draft.detected_price,
        min_price: product.min_price,
        status: compliance.status,
        origin,
    };
    let id = store.with_conn(|conn| db::insert_listing(conn, &listing, Utc::now()))?;
    info!(
        id,
        code = listing.code.as_deref(),
        status = %compliance.status,
        origin = %origin,
        "listing created"
    );
    Ok((Submitted { id, warning }, compliance))
}

/// Admin entry of a listing to monitor.
pub fn create_listing(store: &Store, draft: &ListingDraft) -> Result<(Submitted, Compliance), SubmitError> {
    insert_evaluated_listing(store, draft, Origin::Manual)
}

/// Store a new detected price and the status derived from it.
pub fn update_listing_price(store: &Store, id: Id, price: Decimal) -> Result<Compliance, SubmitError> {
    require_positive("detected price", price)?;
    let listing = store
        .with_conn(|conn| db::get_listing(conn, id))?
        .ok_or(SubmitError::NotFound { kind: "listing", id })?;
    apply_price(store, &listing, price)
}

fn apply_price(store: &Store, listing: &MonitoredListing, price: Decimal) -> Result<Compliance, SubmitError> {
    let compliance = evaluate(price, listing.min_price)?;
    store.with_conn(|conn| {
        db::update_listing_price(conn, listing.id, price, compliance.status, Utc::now())
    })?;
    if compliance.status != listing.status {
        info!(
            id = listing.id,
            from = %listing.status,
            to = %compliance.status,
            %price,
            "listing status changed"
        );
    }
    Ok(compliance)
}

// ── Complaints ──

#[derive(Debug, Clone, Default)]
pub struct ComplaintDraft {
    pub client_id: Id,
    pub product_id: Id,
    pub marketplace_id: Option<Id>,
    pub url: String,
    pub reported_price: Decimal,
    pub notes: Option<String>,
}

pub fn submit_complaint(store: &Store, draft: &ComplaintDraft) -> Result<Submitted, SubmitError> {
    let url = parse_url(&draft.url)?;
    require_positive("reported price", draft.reported_price)?;
    let product = load_product(store, draft.product_id)?;
    let marketplace = pick_marketplace(store, draft.marketplace_id, &url)?;

    let warning = gate(is_duplicate(store, &DuplicateKey::Url(url.clone())))?;

    let complaint = NewComplaint {
        client_id: draft.client_id,
        product_id: product.id,
        marketplace_id: marketplace.id,
        url,
        reported_price: draft.reported_price,
        notes: draft.notes.clone().filter(|n| !n.trim().is_empty()),
    };
    let id = store.with_conn(|conn| db::insert_complaint(conn, &complaint, Utc::now()))?;
    info!(id, client = complaint.client_id, url = %complaint.url, "complaint submitted");
    Ok(Submitted { id, warning })
}

pub fn update_complaint(
    store: &Store,
    id: Id,
    status: ComplaintStatus,
    comment: Option<&str>,
) -> Result<(), SubmitError> {
    if !store.with_conn(|conn| db::update_complaint(conn, id, status, comment))? {
        return Err(SubmitError::NotFound { kind: "complaint", id });
    }
    info!(id, %status, "complaint updated");
    Ok(())
}

/// Start monitoring the listing a resolved complaint points at. The
/// complaint itself is left as it is.
pub fn convert_complaint(
    store: &Store,
    complaint_id: Id,
    detected_price: Option<Decimal>,
) -> Result<(Submitted, Compliance), SubmitError> {
    let complaint = store
        .with_conn(|conn| db::get_complaint(conn, complaint_id))?
        .ok_or(SubmitError::NotFound {
            kind: "complaint",
            id: complaint_id,
        })?;
    if complaint.status != ComplaintStatus::Resolved {
        return Err(SubmitError::Input(format!(
            "complaint {complaint_id} is {}; only resolved complaints can be converted",
            complaint.status
        )));
    }

    let draft = ListingDraft {
        url: complaint.url.clone(),
        product_id: complaint.product_id,
        marketplace_id: Some(complaint.marketplace_id),
        code: None,
        client_id: Some(complaint.client_id),
        detected_price: detected_price.unwrap_or(complaint.reported_price),
    };
    insert_evaluated_listing(store, &draft, Origin::ComplaintConverted)
}

// ── Callback ingestion ──

/// Inbound push from the scraping service. Extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub code: String,
    #[serde(default)]
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Updated(Vec<(Id, Compliance)>),
    NoPrice,
    Unmatched,
}

pub fn ingest_callback(store: &Store, payload: &CallbackPayload) -> Result<CallbackOutcome, SubmitError> {
    let code = ListingCode::normalize(&payload.code)
        .ok_or_else(|| SubmitError::Input(format!("unrecognized listing code: {}", payload.code)))?;
    let listings = store.with_conn(|conn| db::find_listings_by_code(conn, code.as_str()))?;
    if listings.is_empty() {
        warn!(%code, "callback for unknown listing code");
        return Ok(CallbackOutcome::Unmatched);
    }
    let Some(price) = payload.price else {
        info!(%code, "callback without price, nothing to update");
        return Ok(CallbackOutcome::NoPrice);
    };
    require_positive("price", price)?;

    let mut updated = Vec::with_capacity(listings.len());
    for listing in &listings {
        updated.push((listing.id, apply_price(store, listing, price)?));
    }
    Ok(CallbackOutcome::Updated(updated))
}

/// Persist a price that arrived through enrichment.
pub fn record_enriched_price(
    store: &Store,
    listing: &MonitoredListing,
    price: Decimal,
) -> Result<Compliance, SubmitError> {
    require_positive("price", price)?;
    apply_price(store, listing, price)
}
