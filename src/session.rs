//! Live resolution of the URL being typed into a submission form.
//!
//! Every `set_url` starts a new generation: the previous pipeline task is
//! aborted and the shared state is replaced wholesale. Each write the
//! pipeline makes carries the generation it was started under and is
//! dropped if a newer one has been published, which covers the window
//! where an aborted task was already past its last await.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::enrich::{EnrichRequest, EnrichmentSnapshot, EnrichmentSource, Outcome, Poller};
use crate::guard::{self, DuplicateKey, DuplicateLookup, Verdict};
use crate::model::Marketplace;
use crate::resolve::{extract_code, resolve_marketplace, ListingCode};

/// Which form the session feeds; decides the duplicate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Listing,
    Complaint,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentState {
    Skipped,
    Running,
    Finished(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateState {
    /// No key to check (empty URL, input error, or no code for a listing).
    NotApplicable,
    Pending,
    Checked(Verdict),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub generation: u64,
    pub url: String,
    pub input_error: Option<String>,
    pub marketplace: Option<Marketplace>,
    pub code: Option<ListingCode>,
    pub duplicate: DuplicateState,
    pub enrichment: EnrichmentState,
}

impl Resolution {
    fn empty(generation: u64, url: String) -> Self {
        Self {
            generation,
            url,
            input_error: None,
            marketplace: None,
            code: None,
            duplicate: DuplicateState::NotApplicable,
            enrichment: EnrichmentState::Skipped,
        }
    }

    pub fn snapshot(&self) -> Option<&EnrichmentSnapshot> {
        match &self.enrichment {
            EnrichmentState::Finished(outcome) => outcome.snapshot(),
            _ => None,
        }
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        match &self.duplicate {
            DuplicateState::Checked(v) => Some(v),
            _ => None,
        }
    }

    /// Submit stays disabled on bad input, on a duplicate, and until the
    /// duplicate check has answered.
    pub fn can_submit(&self) -> bool {
        if self.url.is_empty() || self.input_error.is_some() {
            return false;
        }
        match &self.duplicate {
            DuplicateState::Pending => false,
            DuplicateState::Checked(v) => !v.blocks(),
            DuplicateState::NotApplicable => true,
        }
    }

    /// Whether the pipeline for this generation has nothing left to do.
    pub fn is_settled(&self) -> bool {
        self.duplicate != DuplicateState::Pending && self.enrichment != EnrichmentState::Running
    }
}

struct Shared<S, L> {
    purpose: Purpose,
    marketplaces: Vec<Marketplace>,
    lookup: L,
    poller: Poller<S>,
}

pub struct ResolutionSession<S, L> {
    shared: Arc<Shared<S, L>>,
    state: Arc<watch::Sender<Resolution>>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl<S, L> ResolutionSession<S, L>
where
    S: EnrichmentSource + 'static,
    L: DuplicateLookup + Send + Sync + 'static,
{
    pub fn new(purpose: Purpose, marketplaces: Vec<Marketplace>, lookup: L, poller: Poller<S>) -> Self {
        let (tx, _) = watch::channel(Resolution::empty(0, String::new()));
        Self {
            shared: Arc::new(Shared {
                purpose,
                marketplaces,
                lookup,
                poller,
            }),
            state: Arc::new(tx),
            generation: 0,
            task: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Resolution> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Resolution {
        self.state.borrow().clone()
    }

    /// Re-run the pipeline for a new URL, superseding whatever was running.
    pub fn set_url(&mut self, url: impl Into<String>) {
        let url = url.into().trim().to_string();
        self.generation += 1;
        let generation = self.generation;

        if let Some(task) = self.task.take() {
            task.abort();
        }

        let mut resolution = Resolution::empty(generation, url.clone());
        let key = if url.is_empty() {
            None
        } else if let Err(e) = Url::parse(&url) {
            resolution.input_error = Some(format!("not a valid URL: {e}"));
            None
        } else {
            resolution.marketplace = resolve_marketplace(&url, &self.shared.marketplaces).cloned();
            resolution.code = extract_code(&url, resolution.marketplace.as_ref());
            match (self.shared.purpose, &resolution.code) {
                (Purpose::Listing, Some(code)) => Some(DuplicateKey::Code(code.clone())),
                (Purpose::Listing, None) => None,
                (Purpose::Complaint, _) => Some(DuplicateKey::Url(url.clone())),
            }
        };

        debug!(
            generation,
            url = %resolution.url,
            marketplace = resolution.marketplace.as_ref().map(|m| m.name.as_str()),
            code = resolution.code.as_ref().map(ListingCode::as_str),
            "resolution started"
        );

        let request = resolution.code.clone().map(|code| {
            let request = EnrichRequest::new(code);
            match &resolution.marketplace {
                Some(m) => request.with_context(url.clone(), m.name.clone()),
                None => request,
            }
        });

        if key.is_some() {
            resolution.duplicate = DuplicateState::Pending;
        } else if request.is_some() {
            resolution.enrichment = EnrichmentState::Running;
        }
        let needs_task = key.is_some() || request.is_some();
        self.state.send_replace(resolution);

        if needs_task {
            let shared = Arc::clone(&self.shared);
            let state = Arc::clone(&self.state);
            self.task = Some(tokio::spawn(drive(shared, state, generation, key, request)));
        }
    }

    /// Wait for the current generation's pipeline to finish.
    pub async fn settled(&mut self) -> Resolution {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.current()
    }
}

/// Apply `f` only if `generation` is still the published one.
fn publish(
    state: &watch::Sender<Resolution>,
    generation: u64,
    f: impl FnOnce(&mut Resolution),
) -> bool {
    state.send_if_modified(|current| {
        if current.generation != generation {
            return false;
        }
        f(current);
        true
    })
}

async fn drive<S, L>(
    shared: Arc<Shared<S, L>>,
    state: Arc<watch::Sender<Resolution>>,
    generation: u64,
    key: Option<DuplicateKey>,
    request: Option<EnrichRequest>,
) where
    S: EnrichmentSource + 'static,
    L: DuplicateLookup + Send + Sync + 'static,
{
    if let Some(key) = key {
        // The lookup is a synchronous store query.
        let lookup = Arc::clone(&shared);
        let check = tokio::task::spawn_blocking(move || guard::is_duplicate(&lookup.lookup, &key));
        let verdict = match check.await {
            Ok(verdict) => verdict,
            Err(e) => Verdict::Unverified(format!("duplicate check did not finish: {e}")),
        };
        let blocked = verdict.blocks();
        let enrich_next = !blocked && request.is_some();
        let applied = publish(&state, generation, |r| {
            r.duplicate = DuplicateState::Checked(verdict);
            if enrich_next {
                r.enrichment = EnrichmentState::Running;
            }
        });
        if !applied {
            debug!(generation, "stale duplicate verdict dropped");
            return;
        }
        if blocked {
            info!(generation, "duplicate blocks submission, skipping enrichment");
            return;
        }
    }

    let Some(request) = request else {
        return;
    };
    let outcome = shared.poller.enrich(&request).await;
    if !publish(&state, generation, |r| {
        r.enrichment = EnrichmentState::Finished(outcome)
    }) {
        debug!(generation, "stale enrichment result dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::enrich::poller::DEFAULT_RETRY_DELAY;
    use crate::enrich::testing::{data, started, ScriptedSource};
    use crate::error::StoreError;
    use crate::guard::{tests::FailingLookup, ExistsQuery};

    /// Lookup that reports the given listing codes / complaint URLs as taken.
    #[derive(Default)]
    struct Taken(Vec<String>);

    impl DuplicateLookup for Taken {
        fn exists(&self, query: &ExistsQuery) -> Result<bool, StoreError> {
            let key = match query {
                ExistsQuery::ListingCode(code) => code,
                ExistsQuery::ComplaintUrl { url, .. } => url,
            };
            Ok(self.0.iter().any(|k| k == key))
        }
    }

    const A: &str = "https://produto.mercadolivre.com.br/MLB-1111111111-a";
    const B: &str = "https://produto.mercadolivre.com.br/MLB-2222222222-b";

    fn marketplaces() -> Vec<Marketplace> {
        vec![Marketplace {
            id: 1,
            name: "Mercado Livre".into(),
            base_url: "https://www.mercadolivre.com.br".into(),
            active: true,
        }]
    }

    fn session<L>(
        purpose: Purpose,
        lookup: L,
        source: ScriptedSource,
    ) -> (Arc<ScriptedSource>, ResolutionSession<Arc<ScriptedSource>, L>)
    where
        L: DuplicateLookup + Send + Sync + 'static,
    {
        let source = Arc::new(source);
        let poller = Poller::new(source.clone(), DEFAULT_RETRY_DELAY);
        (source.clone(), ResolutionSession::new(purpose, marketplaces(), lookup, poller))
    }

    #[tokio::test(start_paused = true)]
    async fn full_pipeline_fills_state() {
        let (source, mut s) = session(
            Purpose::Listing,
            Taken::default(),
            ScriptedSource::new().reply("MLB-1111111111", data("89.90", "A")),
        );
        s.set_url(A);
        let r = s.settled().await;

        assert_eq!(r.marketplace.as_ref().map(|m| m.id), Some(1));
        assert_eq!(r.code.as_ref().map(ListingCode::as_str), Some("MLB-1111111111"));
        assert_eq!(r.verdict(), Some(&Verdict::Clear));
        assert_eq!(r.snapshot().and_then(|s| s.title.as_deref()), Some("A"));
        assert!(r.can_submit());
        assert!(r.is_settled());

        let sent = &source.requests()[0];
        assert_eq!(sent.url.as_deref(), Some(A));
        assert_eq!(sent.marketplace.as_deref(), Some("Mercado Livre"));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_url_supersedes_pending_retry() {
        let (source, mut s) = session(
            Purpose::Listing,
            Taken::default(),
            ScriptedSource::new()
                .reply("MLB-1111111111", started())
                .reply("MLB-1111111111", data("1.00", "stale A"))
                .reply("MLB-2222222222", data("2.00", "B")),
        );

        s.set_url(A);
        // A gets its first reply and parks in the retry delay.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls_for("MLB-1111111111"), 1);
        assert_eq!(s.current().enrichment, EnrichmentState::Running);

        s.set_url(B);
        let r = s.settled().await;
        tokio::time::sleep(DEFAULT_RETRY_DELAY * 2).await;

        let r_after = s.current();
        assert_eq!(r, r_after);
        assert_eq!(r_after.code.as_ref().map(ListingCode::as_str), Some("MLB-2222222222"));
        assert_eq!(r_after.snapshot().and_then(|s| s.title.as_deref()), Some("B"));
        assert_eq!(source.calls_for("MLB-1111111111"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_cannot_write() {
        let (_, mut s) = session(
            Purpose::Listing,
            Taken::default(),
            ScriptedSource::new()
                .reply("MLB-1111111111", data("1.00", "stale"))
                .reply("MLB-2222222222", data("2.00", "fresh")),
        );
        s.set_url(A);
        let _ = s.settled().await;
        s.set_url(B);
        let fresh = s.settled().await;

        // Run a first-generation pipeline to completion after the fact, as
        // if abort had come too late.
        let code = ListingCode::normalize("MLB-1111111111").unwrap();
        drive(
            Arc::clone(&s.shared),
            Arc::clone(&s.state),
            1,
            Some(DuplicateKey::Code(code.clone())),
            Some(EnrichRequest::new(code)),
        )
        .await;

        assert_eq!(s.current(), fresh);
    }

    /// Lookup that blocks its thread until released.
    struct Gated(std::sync::Mutex<std::sync::mpsc::Receiver<bool>>);

    impl DuplicateLookup for Gated {
        fn exists(&self, _query: &ExistsQuery) -> Result<bool, StoreError> {
            Ok(self.0.lock().unwrap().recv().unwrap_or(false))
        }
    }

    #[tokio::test]
    async fn blocking_lookup_does_not_stall_the_runtime() {
        let (release, gate) = std::sync::mpsc::channel();
        let (_, mut s) = session(
            Purpose::Listing,
            Gated(std::sync::Mutex::new(gate)),
            ScriptedSource::new().reply("MLB-1111111111", data("1.00", "A")),
        );
        s.set_url(A);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(s.current().duplicate, DuplicateState::Pending);

        release.send(false).unwrap();
        let r = s.settled().await;
        assert_eq!(r.verdict(), Some(&Verdict::Clear));
        assert!(r.snapshot().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_code_blocks_and_skips_enrichment() {
        let (source, mut s) = session(
            Purpose::Listing,
            Taken(vec!["MLB-1111111111".into()]),
            ScriptedSource::new().reply("MLB-1111111111", data("1.00", "A")),
        );
        s.set_url(A);
        let r = s.settled().await;

        assert!(matches!(r.verdict(), Some(Verdict::Duplicate(_))));
        assert_eq!(r.enrichment, EnrichmentState::Skipped);
        assert!(!r.can_submit());
        assert_eq!(source.calls_for("MLB-1111111111"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn complaint_sessions_check_url_even_without_code() {
        let url = "https://www.mercadolivre.com.br/ofertas";
        let (_, mut s) = session(Purpose::Complaint, Taken(vec![url.into()]), ScriptedSource::new());
        s.set_url(url);
        let r = s.settled().await;

        assert!(r.code.is_none());
        assert!(r.verdict().is_some_and(Verdict::blocks));
        assert_eq!(r.enrichment, EnrichmentState::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_still_allows_submit() {
        let (_, mut s) = session(
            Purpose::Listing,
            FailingLookup,
            ScriptedSource::new().reply("MLB-1111111111", data("1.00", "A")),
        );
        s.set_url(A);
        let r = s.settled().await;
        assert!(matches!(r.verdict(), Some(Verdict::Unverified(_))));
        assert!(r.can_submit());
        assert!(r.snapshot().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_url_makes_no_calls() {
        let (source, mut s) = session(Purpose::Complaint, Taken::default(), ScriptedSource::new());
        s.set_url("mercadolivre.com.br/MLB-1111111111");
        let r = s.settled().await;

        assert!(r.input_error.is_some());
        assert!(r.marketplace.is_none());
        assert!(!r.can_submit());
        assert!(source.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_listing_url_is_a_miss_not_an_error() {
        let (source, mut s) = session(Purpose::Listing, Taken::default(), ScriptedSource::new());
        s.set_url("https://www.ebay.com/itm/123");
        let r = s.settled().await;

        assert!(r.input_error.is_none());
        assert!(r.marketplace.is_none());
        assert!(r.code.is_none());
        assert_eq!(r.duplicate, DuplicateState::NotApplicable);
        assert!(source.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_each_generation_replace_state() {
        let (_, mut s) = session(
            Purpose::Listing,
            Taken::default(),
            ScriptedSource::new().reply("MLB-2222222222", data("2.00", "B")),
        );
        let mut rx = s.subscribe();
        s.set_url(A);
        s.set_url(B);
        let r = rx.wait_for(|r| r.generation == 2 && r.is_settled()).await.unwrap().clone();
        assert_eq!(r.url, B);
        assert!(r.snapshot().is_some());
    }
}
