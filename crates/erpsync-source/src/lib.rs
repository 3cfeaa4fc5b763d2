//! Upstream ERP API client and the page-by-page fetch loop.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use erpsync_core::RawRecord;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info_span, Instrument};

pub mod pager;

pub use pager::{FetchedPage, PageStream};

pub const CRATE_NAME: &str = "erpsync-source";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("full page did not advance the cursor past {cursor}")]
    StalledCursor { cursor: i64 },
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }

    /// Upstream error body, decoded as JSON when it is JSON.
    pub fn details(&self) -> Option<Value> {
        match self {
            FetchError::HttpStatus { body, .. } if !body.is_empty() => Some(
                serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.clone())),
            ),
            _ => None,
        }
    }
}

/// Anything that can return one page of flat records for a query.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<RawRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ErpClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub license: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ErpClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            license: None,
            username: None,
            password: None,
            timeout: Duration::from_secs(600),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    value: Vec<RawRecord>,
}

#[derive(Debug, Clone)]
pub struct ErpClient {
    client: reqwest::Client,
    config: ErpClientConfig,
}

impl ErpClient {
    pub fn new(config: ErpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    /// Absolute endpoints are used as-is; paths are joined onto the base URL.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn request(&self, url: &str, params: &[(String, String)]) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url).query(params);
        if let Some(key) = &self.config.api_key {
            req = req.header("x-api-key", key);
        }
        if let Some(license) = &self.config.license {
            req = req.header("License", license);
        }
        if let Some(user) = &self.config.username {
            req = req.basic_auth(user, self.config.password.as_deref());
        }
        req
    }
}

#[async_trait]
impl PageSource for ErpClient {
    async fn fetch_page(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<RawRecord>, FetchError> {
        let url = self.endpoint_url(endpoint);
        let span = info_span!("erp_fetch", endpoint, params = params.len());

        async {
            let resp = self
                .request(&url, params)
                .send()
                .await
                .map_err(|e| FetchError::from_reqwest(&url, e))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                error!(status = status.as_u16(), %url, body = %body, "upstream request failed");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url,
                    body,
                });
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| FetchError::from_reqwest(&url, e))?;
            let envelope: Envelope = serde_json::from_slice(&bytes)
                .map_err(|source| FetchError::Decode {
                    url: url.clone(),
                    source,
                })?;
            debug!(records = envelope.value.len(), "page fetched");
            Ok(envelope.value)
        }
        .instrument(span)
        .await
    }
}
