use tracing::{debug, warn};

use crate::db::{self, Store};
use crate::error::StoreError;
use crate::resolve::ListingCode;

/// Existence queries the duplicate guard needs from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistsQuery {
    /// Any listing carrying this code, whatever its status.
    ListingCode(String),
    /// A complaint for exactly this URL.
    ComplaintUrl { url: String, open_only: bool },
}

pub trait DuplicateLookup {
    fn exists(&self, query: &ExistsQuery) -> Result<bool, StoreError>;
}

impl DuplicateLookup for Store {
    fn exists(&self, query: &ExistsQuery) -> Result<bool, StoreError> {
        self.with_conn(|conn| match query {
            ExistsQuery::ListingCode(code) => db::listing_code_exists(conn, code),
            ExistsQuery::ComplaintUrl { url, open_only } => {
                db::complaint_url_exists(conn, url, *open_only)
            }
        })
    }
}

/// What a submission is deduplicated on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateKey {
    /// Monitored listings: a code blocks forever once used.
    Code(ListingCode),
    /// Complaints: only open complaints for the same URL block.
    Url(String),
}

impl DuplicateKey {
    fn query(&self) -> ExistsQuery {
        match self {
            Self::Code(code) => ExistsQuery::ListingCode(code.as_str().to_string()),
            Self::Url(url) => ExistsQuery::ComplaintUrl {
                url: url.clone(),
                open_only: true,
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Code(code) => format!("a listing with code {code} is already registered"),
            Self::Url(url) => format!("an open complaint already exists for {url}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clear,
    Duplicate(String),
    /// The lookup failed. Submission is allowed anyway; the message is
    /// shown as a warning.
    Unverified(String),
}

impl Verdict {
    pub fn blocks(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Check a key against the store. Lookup failures fail open.
pub fn is_duplicate<L: DuplicateLookup + ?Sized>(lookup: &L, key: &DuplicateKey) -> Verdict {
    match lookup.exists(&key.query()) {
        Ok(true) => {
            debug!(?key, "duplicate detected");
            Verdict::Duplicate(key.describe())
        }
        Ok(false) => Verdict::Clear,
        Err(error) => {
            warn!(?key, %error, "duplicate check failed, allowing submission");
            Verdict::Unverified(format!("could not verify duplicates: {error}"))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::*;
    use chrono::Utc;

    pub(crate) struct FailingLookup;

    impl DuplicateLookup for FailingLookup {
        fn exists(&self, _query: &ExistsQuery) -> Result<bool, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    fn code(raw: &str) -> ListingCode {
        ListingCode::normalize(raw).unwrap()
    }

    fn seeded() -> (Store, Id, Id) {
        let store = Store::open_in_memory().unwrap();
        let ids = store
            .with_conn(|conn| {
                let mp = db::insert_marketplace(conn, "ML", "https://www.mercadolivre.com.br")?;
                let p = db::insert_product(conn, "P", "SKU-1", "100".parse().unwrap())?;
                Ok((mp, p))
            })
            .unwrap();
        (store, ids.0, ids.1)
    }

    #[test]
    fn used_code_blocks_regardless_of_status() {
        let (store, mp, product) = seeded();
        for status in [ComplianceStatus::Compliant, ComplianceStatus::BelowMinimum] {
            let c = if status == ComplianceStatus::Compliant { "MLB-1111111111" } else { "MLB-2222222222" };
            store
                .with_conn(|conn| {
                    db::insert_listing(
                        conn,
                        &NewListing {
                            url: format!("https://x.com/{c}"),
                            code: Some(c.into()),
                            product_id: product,
                            marketplace_id: mp,
                            client_id: None,
                            detected_price: "100".parse().unwrap(),
                            min_price: "100".parse().unwrap(),
                            status,
                            origin: Origin::Manual,
                        },
                        Utc::now(),
                    )
                })
                .unwrap();
            let verdict = is_duplicate(&store, &DuplicateKey::Code(code(c)));
            assert!(verdict.blocks(), "{c}: {verdict:?}");
        }
        assert_eq!(is_duplicate(&store, &DuplicateKey::Code(code("MLB-3333333333"))), Verdict::Clear);
    }

    #[test]
    fn resolved_complaint_does_not_block_new_one() {
        let (store, mp, product) = seeded();
        let url = "https://produto.mercadolivre.com.br/MLB-1111111111-x";
        let id = store
            .with_conn(|conn| {
                db::insert_complaint(
                    conn,
                    &NewComplaint {
                        client_id: 1,
                        product_id: product,
                        marketplace_id: mp,
                        url: url.into(),
                        reported_price: "90".parse().unwrap(),
                        notes: None,
                    },
                    Utc::now(),
                )
            })
            .unwrap();

        let key = DuplicateKey::Url(url.into());
        assert!(is_duplicate(&store, &key).blocks());

        store
            .with_conn(|conn| db::update_complaint(conn, id, ComplaintStatus::InProgress, None))
            .unwrap();
        assert!(is_duplicate(&store, &key).blocks());

        store
            .with_conn(|conn| db::update_complaint(conn, id, ComplaintStatus::Resolved, None))
            .unwrap();
        assert_eq!(is_duplicate(&store, &key), Verdict::Clear);
    }

    #[test]
    fn url_match_is_exact() {
        let (store, mp, product) = seeded();
        store
            .with_conn(|conn| {
                db::insert_complaint(
                    conn,
                    &NewComplaint {
                        client_id: 1,
                        product_id: product,
                        marketplace_id: mp,
                        url: "https://x.com/a".into(),
                        reported_price: "90".parse().unwrap(),
                        notes: None,
                    },
                    Utc::now(),
                )
            })
            .unwrap();
        assert_eq!(is_duplicate(&store, &DuplicateKey::Url("https://x.com/a?ref=1".into())), Verdict::Clear);
    }

    #[test]
    fn lookup_failure_fails_open() {
        let verdict = is_duplicate(&FailingLookup, &DuplicateKey::Code(code("MLB-1111111111")));
        assert!(matches!(verdict, Verdict::Unverified(_)));
        assert!(!verdict.blocks());
    }
}
