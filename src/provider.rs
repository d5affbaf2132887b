//! # Provider — External Channel Metrics Client
//!
//! Fetches current subscriber, view, and video counts for one channel from
//! the metrics provider:
//!
//! ```text
//! GET {PROVIDER_URL}/channels/{external_id}/stats
//! Authorization: Bearer {PROVIDER_API_KEY}     (when configured)
//!
//! 200 {"subscribers": 1200, "views": 48000, "videos": 31}
//! ```
//!
//! Network errors, `429`, and `5xx` replies are retried with exponential
//! backoff; other `4xx` replies fail immediately. Every attempt is counted
//! under [`FETCH_OP`] in the batch's [`OpRecorder`].

use crate::runner::OpRecorder;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const FETCH_OP: &str = "fetch_metrics";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub subscribers: i64,
    pub views: i64,
    pub videos: i64,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    /// Attempts per fetch, first try included.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub initial_backoff: Duration,
}

impl ProviderConfig {
    pub fn new(base_url: Url) -> Self {
        ProviderConfig {
            base_url,
            api_key: None,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(ProviderClient { client, config })
    }

    fn stats_url(&self, external_id: &str) -> Result<Url> {
        let base = self.config.base_url.as_str().trim_end_matches('/');
        let url = format!(
            "{}/channels/{}/stats",
            base,
            urlencoding::encode(external_id)
        );
        Url::parse(&url).with_context(|| format!("invalid provider url {}", url))
    }

    pub async fn fetch_channel_metrics(
        &self,
        external_id: &str,
        ops: &OpRecorder,
    ) -> Result<ChannelMetrics> {
        let url = self.stats_url(external_id)?;
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;
        let mut last_err = anyhow!("no attempts made");

        for attempt in 1..=attempts {
            if attempt > 1 {
                ops.retry(FETCH_OP);
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            ops.call(FETCH_OP);

            match self.fetch_once(&url).await {
                Ok(metrics) => {
                    debug!(external_id, attempt, "provider fetch succeeded");
                    return Ok(metrics);
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retryable(e)) => {
                    if attempt < attempts {
                        warn!(external_id, attempt, error = %format!("{e:#}"), "provider fetch failed, retrying");
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err.context(format!("provider fetch gave up after {} attempts", attempts)))
    }

    async fn fetch_once(&self, url: &Url) -> std::result::Result<ChannelMetrics, Attempt> {
        let mut req = self.client.get(url.clone());
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| Attempt::Retryable(anyhow!(e).context("provider request failed")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<ChannelMetrics>()
                .await
                .map_err(|e| Attempt::Fatal(anyhow!(e).context("undecodable provider reply")));
        }

        let body = response.text().await.unwrap_or_default();
        let err = anyhow!(
            "provider returned HTTP {}: {}",
            status,
            crate::truncate_chars(body.trim(), 200)
        );
        if is_retryable(status) {
            Err(Attempt::Retryable(err))
        } else {
            Err(Attempt::Fatal(err))
        }
    }
}

enum Attempt {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Build a client from optional settings; `None` when no provider is set.
pub fn from_settings(base_url: Option<&str>, api_key: Option<&str>) -> Result<Option<ProviderClient>> {
    let Some(raw) = base_url.map(str::trim).filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    let base_url = Url::parse(raw).with_context(|| format!("invalid PROVIDER_URL '{}'", raw))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        bail!("PROVIDER_URL must be http or https, got '{}'", base_url.scheme());
    }
    let mut config = ProviderConfig::new(base_url);
    config.api_key = api_key.map(str::to_string).filter(|k| !k.is_empty());
    Ok(Some(ProviderClient::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn stats_url_encodes_external_id_and_tolerates_trailing_slash() {
        let client = ProviderClient::new(ProviderConfig::new(
            Url::parse("https://metrics.example.com/v1/").unwrap(),
        ))
        .unwrap();
        assert_eq!(
            client.stats_url("UC a/b").unwrap().as_str(),
            "https://metrics.example.com/v1/channels/UC%20a%2Fb/stats"
        );
    }

    #[test]
    fn from_settings_handles_missing_and_bad_urls() {
        assert!(from_settings(None, None).unwrap().is_none());
        assert!(from_settings(Some("  "), None).unwrap().is_none());
        assert!(from_settings(Some("ftp://x"), None).is_err());
        assert!(from_settings(Some("not a url"), None).is_err());
        assert!(from_settings(Some("http://localhost:9000"), Some("k"))
            .unwrap()
            .is_some());
    }
}
