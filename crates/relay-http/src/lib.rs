//! Shared HTTP client plumbing for CRM and chat calls.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "relay-http";

/// Longest response body excerpt carried in an error.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

/// Thin wrapper over a pooled `reqwest::Client` with a fixed timeout.
///
/// No retries happen here; callers decide how a failed call degrades.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` with query parameters and extra headers, decoding a JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let span = info_span!("http_request", method = "GET", url);
        async {
            let resp = self
                .client
                .get(url)
                .headers(header_map(headers)?)
                .query(query)
                .send()
                .await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?;

            if !status.is_success() {
                return Err(status_error(status, final_url, &body));
            }

            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }

    /// POST a JSON body; any 2xx counts as success.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<StatusCode, FetchError> {
        let span = info_span!("http_request", method = "POST", url);
        async {
            let resp = self.client.post(url).json(body).send().await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(status);
            }
            let final_url = resp.url().to_string();
            let body = resp.bytes().await.unwrap_or_default();
            Err(status_error(status, final_url, &body))
        }
        .instrument(span)
        .await
    }
}

fn header_map(headers: &[(&str, &str)]) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::try_from(*name)
            .map_err(|_| FetchError::InvalidHeader((*name).to_string()))?;
        let mut value = HeaderValue::try_from(*value)
            .map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        value.set_sensitive(true);
        map.insert(name, value);
    }
    Ok(map)
}

fn status_error(status: StatusCode, url: String, body: &[u8]) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url,
        body: excerpt(body),
    }
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    match trimmed.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
