use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{EnrichRequest, EnrichmentSnapshot, EnrichmentSource, FetchError};

/// Body the service answers with when it kicked off a scrape instead of
/// returning data.
pub const WORKFLOW_STARTED: &str = "Workflow was started";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How one reply body reads.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Started,
    Data(EnrichmentSnapshot),
    Malformed(String),
}

/// `{"message": "Workflow was started"}`, `[{"data": [{..}]}]`, or neither.
pub fn classify(body: &Value) -> Reply {
    if body.get("message").and_then(Value::as_str) == Some(WORKFLOW_STARTED) {
        return Reply::Started;
    }

    let Some(item) = body
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|first| first.get("data"))
        .and_then(Value::as_array)
        .and_then(|data| data.first())
    else {
        return Reply::Malformed("expected [{\"data\": [{..}]}]".to_string());
    };

    match serde_json::from_value(item.clone()) {
        Ok(snapshot) => Reply::Data(snapshot),
        Err(e) => Reply::Malformed(format!("data object did not decode: {e}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Non-blocking message for the person filling the form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Terminal state of one enrichment run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Complete {
        snapshot: EnrichmentSnapshot,
        retried: bool,
    },
    /// The first request failed outright.
    Failed(FetchError),
    /// Still pending (or broken) after the single retry.
    GaveUp,
    /// First reply was neither pending nor data.
    Malformed(String),
}

impl Outcome {
    pub fn snapshot(&self) -> Option<&EnrichmentSnapshot> {
        match self {
            Self::Complete { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }

    pub fn notice(&self) -> Option<Notice> {
        let (level, message) = match self {
            Self::Complete { .. } => return None,
            Self::Failed(FetchError::NotConfigured) => (
                NoticeLevel::Info,
                "Live listing data is not configured. Enter the price manually.".to_string(),
            ),
            Self::Failed(e) => (
                NoticeLevel::Error,
                format!("Could not reach the listing data service ({e}). Enter the price manually."),
            ),
            Self::GaveUp => (
                NoticeLevel::Info,
                "Listing data is still being collected. You can proceed and fill in the price manually."
                    .to_string(),
            ),
            Self::Malformed(_) => (
                NoticeLevel::Info,
                "Listing data could not be read. Fill in the price manually.".to_string(),
            ),
        };
        Some(Notice { level, message })
    }
}

/// Fetch with one delayed retry when the service reports a started
/// workflow. At most two GETs per call.
pub struct Poller<S> {
    source: S,
    retry_delay: Duration,
}

impl<S: EnrichmentSource> Poller<S> {
    pub fn new(source: S, retry_delay: Duration) -> Self {
        Self {
            source,
            retry_delay,
        }
    }

    pub async fn enrich(&self, request: &EnrichRequest) -> Outcome {
        debug!(code = %request.code, "requesting enrichment");
        let first = match self.source.fetch(request).await {
            Ok(body) => classify(&body),
            Err(FetchError::Decode(e)) => Reply::Malformed(e),
            Err(e) => {
                warn!(code = %request.code, error = %e, "enrichment request failed");
                return Outcome::Failed(e);
            }
        };

        match first {
            Reply::Data(snapshot) => {
                info!(code = %request.code, "enrichment complete");
                Outcome::Complete {
                    snapshot,
                    retried: false,
                }
            }
            Reply::Malformed(reason) => {
                warn!(code = %request.code, %reason, "malformed enrichment response");
                Outcome::Malformed(reason)
            }
            Reply::Started => self.retry_once(request).await,
        }
    }

    async fn retry_once(&self, request: &EnrichRequest) -> Outcome {
        info!(
            code = %request.code,
            delay_ms = self.retry_delay.as_millis() as u64,
            "enrichment pending, retrying once"
        );
        tokio::time::sleep(self.retry_delay).await;

        match self.source.fetch(request).await.map(|body| classify(&body)) {
            Ok(Reply::Data(snapshot)) => {
                info!(code = %request.code, "enrichment complete after retry");
                Outcome::Complete {
                    snapshot,
                    retried: true,
                }
            }
            Ok(reply) => {
                info!(code = %request.code, ?reply, "enrichment not ready, giving up");
                Outcome::GaveUp
            }
            Err(e) => {
                info!(code = %request.code, error = %e, "enrichment retry failed, giving up");
                Outcome::GaveUp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::enrich::testing::{data, started, ScriptedSource};
    use crate::resolve::ListingCode;

    const CODE: &str = "MLB-1234567890";

    fn request() -> EnrichRequest {
        EnrichRequest::new(ListingCode::normalize(CODE).unwrap())
    }

    fn poller(source: ScriptedSource) -> (Arc<ScriptedSource>, Poller<Arc<ScriptedSource>>) {
        let source = Arc::new(source);
        (source.clone(), Poller::new(source, DEFAULT_RETRY_DELAY))
    }

    #[test]
    fn classify_shapes() {
        assert_eq!(classify(&json!({"message": "Workflow was started"})), Reply::Started);
        assert!(matches!(
            classify(&json!([{"data": [{"price": "10.5", "title": "x"}]}])),
            Reply::Data(s) if s.price == Some("10.5".parse().unwrap())
        ));
        for body in [
            json!({"message": "something else"}),
            json!([]),
            json!([{"data": []}]),
            json!([{"other": [{}]}]),
            json!({"data": [{"price": 1}]}),
            json!([{"data": ["not an object"]}]),
        ] {
            assert!(matches!(classify(&body), Reply::Malformed(_)), "{body}");
        }
    }

    #[test]
    fn unreadable_fields_do_not_discard_the_reply() {
        let Reply::Data(snap) = classify(&json!([{"data": [{
            "price": "not a number",
            "title": "Tenis",
            "rating": 4.8,
            "sales": 1200,
            "discount": "15% OFF",
            "full_price": "R$ 1.299,90"
        }]}])) else {
            panic!("expected data");
        };
        assert_eq!(snap.price, None);
        assert_eq!(snap.title.as_deref(), Some("Tenis"));
        assert_eq!(snap.rating.as_deref(), Some("4.8"));
        assert_eq!(snap.sales.as_deref(), Some("1200"));
        assert_eq!(snap.discount, Some("15".parse().unwrap()));
        assert_eq!(snap.full_price, Some("1299.90".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_data_needs_one_call() {
        let (source, poller) = poller(ScriptedSource::new().reply(CODE, data("99.90", "Tenis")));
        let outcome = poller.enrich(&request()).await;
        assert_eq!(outcome.snapshot().and_then(|s| s.title.as_deref()), Some("Tenis"));
        assert!(matches!(outcome, Outcome::Complete { retried: false, .. }));
        assert_eq!(source.calls_for(CODE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_then_data_retries_once_after_delay() {
        let (source, poller) = poller(
            ScriptedSource::new()
                .reply(CODE, started())
                .reply(CODE, data("149.90", "Tenis X")),
        );
        let start = Instant::now();
        let outcome = poller.enrich(&request()).await;

        assert!(matches!(outcome, Outcome::Complete { retried: true, .. }));
        assert_eq!(outcome.snapshot().unwrap().price, Some("149.90".parse().unwrap()));
        assert_eq!(source.calls_for(CODE), 2);
        assert_eq!(source.requests()[0], source.requests()[1]);
        assert!(start.elapsed() >= DEFAULT_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_twice_gives_up_without_error() {
        let (source, poller) =
            poller(ScriptedSource::new().reply(CODE, started()).reply(CODE, started()).reply(CODE, data("1", "x")));
        let outcome = poller.enrich(&request()).await;

        assert_eq!(outcome, Outcome::GaveUp);
        assert_eq!(outcome.notice().unwrap().level, NoticeLevel::Info);
        assert_eq!(source.calls_for(CODE), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_error_gives_up() {
        let (_, poller) = poller(
            ScriptedSource::new()
                .reply(CODE, started())
                .reply(CODE, Err(FetchError::Status(502))),
        );
        assert_eq!(poller.enrich(&request()).await, Outcome::GaveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_failure_is_reported_as_error() {
        let (source, poller) =
            poller(ScriptedSource::new().reply(CODE, Err(FetchError::Transport("refused".into()))));
        let outcome = poller.enrich(&request()).await;

        assert!(matches!(outcome, Outcome::Failed(FetchError::Transport(_))));
        assert_eq!(outcome.notice().unwrap().level, NoticeLevel::Error);
        assert_eq!(source.calls_for(CODE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_endpoint_is_informational() {
        let poller = Poller::new(crate::enrich::Disabled, DEFAULT_RETRY_DELAY);
        let outcome = poller.enrich(&request()).await;
        assert_eq!(outcome, Outcome::Failed(FetchError::NotConfigured));
        assert_eq!(outcome.notice().unwrap().level, NoticeLevel::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_or_undecodable_body_does_not_retry() {
        let (source, poller) = poller(
            ScriptedSource::new()
                .reply(CODE, Ok(json!({"unexpected": true})))
                .reply(CODE, Err(FetchError::Decode("eof".into()))),
        );
        assert!(matches!(poller.enrich(&request()).await, Outcome::Malformed(_)));
        assert!(matches!(poller.enrich(&request()).await, Outcome::Malformed(_)));
        assert_eq!(source.calls_for(CODE), 2);
    }
}
