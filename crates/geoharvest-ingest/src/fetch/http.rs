use super::BackoffPolicy;
use crate::error::{IngestError, Result};
use futures::StreamExt;
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Settings shared by every fetcher in a harvest
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Sent as `Authorization: OAuth <token>`
    pub token: Option<String>,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            token: None,
            user_agent: format!("geoharvest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Outcome of one attempt: try again, or give up immediately
enum Attempt {
    Retry(BoxError),
    Abort(IngestError),
}

impl From<reqwest::Error> for Attempt {
    fn from(e: reqwest::Error) -> Self {
        Attempt::Retry(Box::new(e))
    }
}

impl From<std::io::Error> for Attempt {
    fn from(e: std::io::Error) -> Self {
        Attempt::Abort(IngestError::Io(e))
    }
}

/// GET client that retries transport failures and non-2xx responses
pub struct HttpFetcher {
    client: Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = header::HeaderValue::from_str(&format!("OAuth {token}"))
                .map_err(|_| IngestError::config("access token is not a valid header value"))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// GET `url` and return the first 2xx response
    pub async fn get(&self, url: &str, params: Option<&[(&str, String)]>) -> Result<Response> {
        self.with_retry(url, move || self.send_attempt(url, params)).await
    }

    /// GET `url` and decode the JSON body
    ///
    /// Reading the body is part of the retried attempt; a body that arrives
    /// but does not decode is not retried.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: Option<&[(&str, String)]>,
    ) -> Result<T> {
        let body = self
            .with_retry(url, move || self.body_attempt(url, params))
            .await?;

        serde_json::from_slice(&body).map_err(|e| IngestError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Stream `url` into `dest`, returning the number of bytes written
    ///
    /// Each attempt truncates `dest`. If every attempt fails the partial file
    /// is removed.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64> {
        let result = self
            .with_retry(url, move || self.download_once(url, dest))
            .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dest.display(), error = %e, "Failed to remove partial download");
                }
            }
        }
        result
    }

    async fn send(
        &self,
        url: &str,
        params: Option<&[(&str, String)]>,
    ) -> std::result::Result<Response, reqwest::Error> {
        let mut request = self.client.get(url);
        if let Some(params) = params {
            request = request.query(params);
        }
        request.send().await?.error_for_status()
    }

    async fn send_attempt(
        &self,
        url: &str,
        params: Option<&[(&str, String)]>,
    ) -> std::result::Result<Response, Attempt> {
        Ok(self.send(url, params).await?)
    }

    async fn body_attempt(
        &self,
        url: &str,
        params: Option<&[(&str, String)]>,
    ) -> std::result::Result<Vec<u8>, Attempt> {
        let response = self.send(url, params).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn download_once(&self, url: &str, dest: &Path) -> std::result::Result<u64, Attempt> {
        let response = self.send(url, None).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn with_retry<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Attempt>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(url, attempts = attempt + 1, "Request succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(Attempt::Abort(e)) => return Err(e),
                Err(Attempt::Retry(source)) => match self.backoff.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            url,
                            attempt = attempt + 1,
                            max_attempts = self.backoff.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %source,
                            "Request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    },
                    None => {
                        return Err(IngestError::TransientNetwork {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            source,
                        })
                    },
                },
            }
        }
    }
}
