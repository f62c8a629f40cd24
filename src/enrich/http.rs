use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{EnrichRequest, EnrichmentSource, FetchError};

/// The external scraping service, reached with a plain GET.
#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpSource {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("floorwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl EnrichmentSource for HttpSource {
    async fn fetch(&self, request: &EnrichRequest) -> Result<Value, FetchError> {
        let mut builder = self.client.get(&self.endpoint).query(&request.query());
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let start = Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = resp.status();
        debug!(
            code = %request.code,
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "enrichment GET"
        );

        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| FetchError::Decode(e.to_string()))
    }
}
