pub mod http;
pub mod poller;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::resolve::ListingCode;

pub use http::HttpSource;
pub use poller::{NoticeLevel, Outcome, Poller};

/// Live listing data used to pre-fill a submission. Never stored as-is.
///
/// Each field is read on its own: a value that cannot be understood becomes
/// `None` instead of discarding the rest of the reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSnapshot {
    #[serde(deserialize_with = "lenient_decimal")]
    pub price: Option<Decimal>,
    #[serde(deserialize_with = "lenient_text")]
    pub title: Option<String>,
    #[serde(alias = "sold", alias = "sales_count", deserialize_with = "lenient_text")]
    pub sales: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub rating: Option<String>,
    #[serde(alias = "seller_name", deserialize_with = "lenient_text")]
    pub seller: Option<String>,
    #[serde(alias = "image_url", alias = "thumbnail", deserialize_with = "lenient_text")]
    pub image: Option<String>,
    #[serde(alias = "discount_percent", deserialize_with = "lenient_decimal")]
    pub discount: Option<Decimal>,
    #[serde(alias = "original_price", deserialize_with = "lenient_decimal")]
    pub full_price: Option<Decimal>,
}

// ── Field decoding ──

/// Strings as-is, numbers and booleans in their JSON spelling.
fn lenient_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Decimal>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => {
            let raw = n.to_string();
            Decimal::from_str(&raw).or_else(|_| Decimal::from_scientific(&raw)).ok()
        }
        Value::String(s) => parse_amount(&s),
        _ => None,
    })
}

/// Read an amount out of display text such as `R$ 1.299,90`, `$1,299.90`
/// or `15% OFF`. The last separator followed by at most two digits is the
/// decimal point.
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(comma), None) if cleaned.len() - comma - 1 <= 2 => cleaned.replace(',', "."),
        (Some(_), None) => cleaned.replace(',', ""),
        (None, Some(dot)) if cleaned.matches('.').count() > 1 || cleaned.len() - dot - 1 == 3 => {
            cleaned.replace('.', "")
        }
        (None, _) => cleaned,
    };
    Decimal::from_str(&normalized).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichRequest {
    pub code: ListingCode,
    pub url: Option<String>,
    pub marketplace: Option<String>,
}

impl EnrichRequest {
    pub fn new(code: ListingCode) -> Self {
        Self {
            code,
            url: None,
            marketplace: None,
        }
    }

    pub fn with_context(mut self, url: impl Into<String>, marketplace: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self.marketplace = Some(marketplace.into());
        self
    }

    /// Query parameters for the GET, in a stable order.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("code", self.code.to_string())];
        if let Some(url) = &self.url {
            params.push(("url", url.clone()));
        }
        if let Some(marketplace) = &self.marketplace {
            params.push(("marketplace", marketplace.clone()));
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("enrichment service unreachable: {0}")]
    Transport(String),
    #[error("enrichment service returned HTTP {0}")]
    Status(u16),
    /// A 2xx whose body was not JSON.
    #[error("enrichment response is not JSON: {0}")]
    Decode(String),
    #[error("no enrichment endpoint configured")]
    NotConfigured,
}

/// One GET against the enrichment endpoint. Implementations must be
/// idempotent; the poller may call twice for the same request.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    async fn fetch(&self, request: &EnrichRequest) -> Result<Value, FetchError>;
}

#[async_trait]
impl<T: EnrichmentSource + ?Sized> EnrichmentSource for Arc<T> {
    async fn fetch(&self, request: &EnrichRequest) -> Result<Value, FetchError> {
        (**self).fetch(request).await
    }
}

/// Stand-in when no endpoint is configured; every fetch fails fast.
pub struct Disabled;

#[async_trait]
impl EnrichmentSource for Disabled {
    async fn fetch(&self, _request: &EnrichRequest) -> Result<Value, FetchError> {
        Err(FetchError::NotConfigured)
    }
}

/// Source for the configured endpoint, or `Disabled`.
pub fn source_from_settings(
    endpoint: Option<&str>,
    token: Option<String>,
) -> Result<Arc<dyn EnrichmentSource>, FetchError> {
    match endpoint.map(str::trim).filter(|e| !e.is_empty()) {
        Some(endpoint) => Ok(Arc::new(HttpSource::new(endpoint, token)?)),
        None => Ok(Arc::new(Disabled)),
    }
}
