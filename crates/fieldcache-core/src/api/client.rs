//! Key-authenticated JSON GET client over a [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{FetchError, FetchResult};
use crate::http::{HttpRequest, HttpResponse, Transport};

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Prefer the `{"error": {"message": ...}}` message over the raw body.
fn upstream_message(response: &HttpResponse) -> String {
    match response.json::<ErrorEnvelope>() {
        Ok(envelope) => envelope.error.message,
        Err(_) => response.text(),
    }
}

pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base_url: Url,
    api_key: Option<String>,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, base_url: &str, api_key: Option<&str>) -> FetchResult<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| FetchError::Configuration(format!("Invalid base URL {}: {}", base_url, e)))?;
        Ok(Self {
            transport,
            base_url: parsed,
            api_key: api_key.map(str::to_string),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn api_key(&self) -> FetchResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| FetchError::Configuration("API key is not configured".to_string()))
    }

    /// Base URL plus path segments (percent-encoded) and query parameters,
    /// with the API key appended.
    pub fn url(&self, segments: &[&str], params: &[(&str, &str)]) -> FetchResult<Url> {
        let key = self.api_key()?;
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Configuration(format!("Base URL cannot take a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("key", key)
            .extend_pairs(params);
        Ok(url)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> FetchResult<T> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self.transport.send(HttpRequest::get(url.clone())).await?;

            if response.is_success() {
                debug!(path = url.path(), status = response.status, "GET");
                return response.json();
            }

            if response.status == 429 {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(FetchError::RateLimited);
                }
                warn!(path = url.path(), retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }

            return Err(FetchError::from_status(response.status, &upstream_message(&response)));
        }
    }
}
