//! Fetching of Breakpad symbol files from upstream symbol stores.
//!
//! The [`ObjectDownloader`] trait is the seam the symbolicator talks to;
//! tests substitute it with a canned implementation. [`HttpDownloader`] is
//! the production implementation over an ordered list of store URLs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

use symserver_common::ModuleKey;

use crate::config::Config;
use crate::metric;

/// Base delay of the exponential retry backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// An error downloading a symbol file.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No configured source has the file.
    #[error("symbol file not found on any source")]
    NotFound,

    /// All sources failed with retryable errors.
    #[error("download failed: {0}")]
    Transient(String),
}

/// Downloads the raw symbol file for a module.
#[async_trait]
pub trait ObjectDownloader: Send + Sync {
    /// Fetches the `.sym` artifact for `key`, returning the decoded bytes.
    async fn download(&self, key: &ModuleKey) -> Result<Vec<u8>, DownloadError>;
}

/// Downloads symbol files over HTTP from an ordered list of symbol stores.
///
/// Sources are tried in order. A 404 advances to the next source; transient
/// failures (5xx, connect errors, timeouts) are retried per source with
/// jittered exponential backoff before advancing. The whole download is
/// bounded by a per-module wall-clock budget.
#[derive(Debug)]
pub struct HttpDownloader {
    client: reqwest::Client,
    sources: Vec<String>,
    retries: u32,
    module_budget: Duration,
}

enum Fetch {
    Done(Vec<u8>),
    NotFound,
    Transient(String),
}

impl HttpDownloader {
    /// Creates a downloader from the service configuration.
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.downloader_timeout)
            .build()?;

        Ok(HttpDownloader {
            client,
            sources: config.symbol_urls.clone(),
            retries: config.downloader_retries,
            module_budget: config.downloader_module_budget,
        })
    }

    async fn download_inner(&self, key: &ModuleKey) -> Result<Vec<u8>, DownloadError> {
        let sym_filename = key.sym_filename();
        let mut saw_transient = None;

        for source in &self.sources {
            let url = format!(
                "{source}/{}/{}/{sym_filename}",
                key.debug_file(),
                key.debug_id()
            );

            match self.fetch_with_retries(&url).await {
                Fetch::Done(bytes) => return Ok(bytes),
                Fetch::NotFound => continue,
                Fetch::Transient(error) => {
                    tracing::warn!(%url, %error, "symbol source failed");
                    saw_transient = Some(error);
                }
            }
        }

        match saw_transient {
            Some(error) => Err(DownloadError::Transient(error)),
            None => Err(DownloadError::NotFound),
        }
    }

    async fn fetch_with_retries(&self, url: &str) -> Fetch {
        let mut attempt = 0u32;
        loop {
            let error = match self.fetch_once(url).await {
                Fetch::Transient(error) => error,
                done => return done,
            };

            if attempt >= self.retries {
                return Fetch::Transient(error);
            }

            tokio::time::sleep(backoff_delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn fetch_once(&self, url: &str) -> Fetch {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(error) => return Fetch::Transient(error.to_string()),
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Fetch::NotFound;
        }
        if !status.is_success() {
            return Fetch::Transient(format!("unexpected status {status}"));
        }

        match response.bytes().await {
            Ok(bytes) => Fetch::Done(bytes.to_vec()),
            Err(error) => Fetch::Transient(error.to_string()),
        }
    }
}

/// The delay before retry number `attempt + 1`: an exponential backoff with
/// ±25% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.mul_f64(2f64.powi(attempt.min(16) as i32));
    base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}

#[async_trait]
impl ObjectDownloader for HttpDownloader {
    async fn download(&self, key: &ModuleKey) -> Result<Vec<u8>, DownloadError> {
        let started = Instant::now();

        let result = match tokio::time::timeout(self.module_budget, self.download_inner(key)).await
        {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Transient(format!(
                "module download budget of {:?} exceeded",
                self.module_budget
            ))),
        };

        let response = if result.is_ok() { "success" } else { "fail" };
        metric!(timer("downloader.download") = started.elapsed(), "response" => response);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_jitter() {
        for attempt in 0..4 {
            let delay = backoff_delay(attempt);
            let nominal = BACKOFF_BASE.mul_f64(2f64.powi(attempt as i32));
            assert!(delay >= nominal.mul_f64(0.75), "{delay:?} too short");
            assert!(delay <= nominal.mul_f64(1.25), "{delay:?} too long");
        }
    }
}
