//! S3-style HTTP object store backend.
//!
//! Objects map to `PUT/GET/DELETE {endpoint}/{bucket}/{namespace}/cas/{key}`.
//! Transient failures (connect errors, 5xx) are retried a bounded number of
//! times with exponential backoff and then surfaced as `Unavailable`; they
//! are never swallowed.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{instrument, warn};

use crate::{Backend, BackendError, Result};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// HTTP object store [`Backend`] for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl ObjectStoreBackend {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        }
    }

    fn object_url(&self, namespace: &str, key: &str) -> String {
        format!(
            "{}/{}/{}/cas/{}",
            self.endpoint, self.bucket, namespace, key
        )
    }

    /// Run `op` with bounded retry. Retries connect errors and 5xx
    /// responses; everything else is returned as-is.
    async fn with_retry<F, Fut>(&self, op: F) -> Result<reqwest::Response>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match op().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = format!("server returned {}", resp.status());
                }
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_err = e.to_string();
                }
                Err(e) => return Err(BackendError::Unavailable(e.to_string())),
            }

            if attempt < MAX_ATTEMPTS {
                warn!(attempt, error = %last_err, "object store request failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(BackendError::Unavailable(format!(
            "giving up after {MAX_ATTEMPTS} attempts: {last_err}"
        )))
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    #[instrument(skip(self, data), level = "debug")]
    async fn store(&self, namespace: &str, key: &str, data: Bytes) -> Result<()> {
        let url = self.object_url(namespace, key);
        let resp = self
            .with_retry(|| self.client.put(&url).body(data.clone()).send())
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "PUT {url} returned {}",
                resp.status()
            )))
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn retrieve(&self, namespace: &str, key: &str) -> Result<Bytes> {
        let url = self.object_url(namespace, key);
        let resp = self.with_retry(|| self.client.get(&url).send()).await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound {
                key: key.to_string(),
            }),
            s if s.is_success() => resp
                .bytes()
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string())),
            s => Err(BackendError::Unavailable(format!(
                "GET {url} returned {s}"
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn contains(&self, namespace: &str, key: &str) -> Result<bool> {
        let url = self.object_url(namespace, key);
        let resp = self.with_retry(|| self.client.head(&url).send()).await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(BackendError::Unavailable(format!(
                "HEAD {url} returned {s}"
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let url = self.object_url(namespace, key);
        let resp = self.with_retry(|| self.client.delete(&url).send()).await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound {
                key: key.to_string(),
            }),
            s if s.is_success() => Ok(()),
            s => Err(BackendError::Unavailable(format!(
                "DELETE {url} returned {s}"
            ))),
        }
    }

    /// Object stores have no real directories; the namespace exists once an
    /// object is written under its prefix. The tenant registry is the source
    /// of truth for provisioning state.
    async fn create_namespace(&self, _namespace: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_namespace(&self, _namespace: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_layout() {
        let backend = ObjectStoreBackend::new("https://s3.example.com/", "strata-cas");
        assert_eq!(
            backend.object_url("acme", "ab12cd34"),
            "https://s3.example.com/strata-cas/acme/cas/ab12cd34"
        );
    }

    #[test]
    fn trailing_slash_trimmed_once() {
        let backend = ObjectStoreBackend::new("http://localhost:9000", "b");
        assert_eq!(backend.object_url("t", "k"), "http://localhost:9000/b/t/cas/k");
    }
}
