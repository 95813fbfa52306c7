//! Service configuration, read from environment variables at startup.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// An error reading the configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is set to an unparseable value.
    #[error("invalid value for environment variable {0}: {1:?}")]
    Invalid(&'static str, String),
}

/// The complete service configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// Ordered upstream symbol store URL prefixes.
    pub symbol_urls: Vec<String>,

    /// Root directory of the on-disk symcache store.
    pub diskcache_root: PathBuf,
    /// High-water mark of the store, in bytes.
    pub diskcache_max_bytes: u64,
    /// Low-water mark eviction shrinks the store to, in bytes.
    pub diskcache_low_water_bytes: u64,
    /// How long a "known missing upstream" entry stays valid.
    pub diskcache_negative_ttl: Duration,

    /// Timeout of a single download attempt.
    pub downloader_timeout: Duration,
    /// Retries per source after a transient failure.
    pub downloader_retries: u32,
    /// Wall-clock budget for all attempts of one module download.
    pub downloader_module_budget: Duration,

    /// Maximum number of jobs accepted in one v5 request.
    pub max_jobs: usize,
    /// Maximum accepted request body size, in bytes.
    pub max_body_bytes: usize,
    /// Deadline for one symbolication request.
    pub request_deadline: Duration,
    /// How many module fetches one request runs concurrently.
    pub fetch_concurrency: usize,

    /// Statsd sink, if configured.
    pub statsd_addr: Option<SocketAddr>,
}

fn var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid(name, value)),
        None => Ok(default),
    }
}

impl Config {
    /// Reads the configuration from the environment.
    ///
    /// `SYMBOL_URLS` and `DISKCACHE_ROOT` are required; everything else has
    /// defaults suitable for local development.
    pub fn from_env() -> Result<Self, ConfigError> {
        let symbol_urls: Vec<String> = var("SYMBOL_URLS")
            .ok_or(ConfigError::Missing("SYMBOL_URLS"))?
            .split(',')
            .map(|url| url.trim().trim_end_matches('/').to_owned())
            .filter(|url| !url.is_empty())
            .collect();
        if symbol_urls.is_empty() {
            return Err(ConfigError::Invalid("SYMBOL_URLS", String::new()));
        }

        let diskcache_root = PathBuf::from(
            var("DISKCACHE_ROOT").ok_or(ConfigError::Missing("DISKCACHE_ROOT"))?,
        );

        let diskcache_max_bytes = parse("DISKCACHE_MAX_BYTES", 40 * 1024 * 1024 * 1024u64)?;
        let diskcache_low_water_bytes = parse(
            "DISKCACHE_LOW_WATER_BYTES",
            diskcache_max_bytes / 10 * 9,
        )?;
        if diskcache_low_water_bytes > diskcache_max_bytes {
            return Err(ConfigError::Invalid(
                "DISKCACHE_LOW_WATER_BYTES",
                diskcache_low_water_bytes.to_string(),
            ));
        }

        let statsd_addr = match (var("STATSD_HOST"), parse("STATSD_PORT", 8125u16)?) {
            (Some(host), port) => {
                use std::net::ToSocketAddrs;
                let addr = (host.as_str(), port)
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or(ConfigError::Invalid("STATSD_HOST", host))?;
                Some(addr)
            }
            (None, _) => None,
        };

        Ok(Config {
            listen_addr: parse("SYMSERVER_LISTEN", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            symbol_urls,
            diskcache_root,
            diskcache_max_bytes,
            diskcache_low_water_bytes,
            diskcache_negative_ttl: Duration::from_secs(parse(
                "DISKCACHE_NEGATIVE_TTL_SECS",
                24 * 60 * 60,
            )?),
            downloader_timeout: Duration::from_millis(parse("DOWNLOADER_TIMEOUT_MS", 5_000)?),
            downloader_retries: parse("DOWNLOADER_RETRIES", 3)?,
            downloader_module_budget: Duration::from_millis(parse(
                "DOWNLOADER_MODULE_BUDGET_MS",
                30_000,
            )?),
            max_jobs: parse("SYMBOLICATE_MAX_JOBS", 10)?,
            max_body_bytes: parse("SYMBOLICATE_MAX_BODY_BYTES", 5 * 1024 * 1024)?,
            request_deadline: Duration::from_millis(parse(
                "SYMBOLICATE_REQUEST_DEADLINE_MS",
                30_000,
            )?),
            fetch_concurrency: parse("SYMBOLICATE_CONCURRENCY", 16)?,
            statsd_addr,
        })
    }
}
