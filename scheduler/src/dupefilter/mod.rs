use std::sync::Arc;

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;

pub mod disk;
pub mod memory;
pub mod redis;

pub use disk::DiskDupeFilter;
pub use memory::MemoryDupeFilter;
pub use redis::{
    RedisBloomDupeFilter, RedisDupeFilter, RetryingRedisBloomDupeFilter, RetryingRedisDupeFilter,
};

/// Terminal outcome of a request, reported back to the filter.
///
/// The retryable filter variants use the `*Err` reasons to retract a
/// fingerprint so the request can be scheduled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Downloaded successfully (parsing still pending or not applicable)
    RequestOk,
    /// Download failed terminally
    RequestErr,
    /// Downloaded and parsed successfully
    ParseOk,
    /// Downloaded but the parser failed
    ParseErr,
}

impl ReleaseReason {
    pub fn is_err(&self) -> bool {
        matches!(self, ReleaseReason::RequestErr | ReleaseReason::ParseErr)
    }
}

/// Decides whether a request has been seen before.
///
/// `seen` is a test-and-set: the first caller for a fingerprint gets
/// `false` and the fingerprint is recorded; every later caller gets `true`.
/// A backend failure surfaces as `Err` and is never interpreted as either
/// answer, since guessing "unseen" duplicates work and guessing "seen"
/// loses requests.
#[async_trait]
pub trait DupeFilter: Send + Sync + 'static {
    async fn seen(&self, request: &Request) -> Result<bool>;

    /// Report the terminal outcome of a request admitted earlier.
    async fn release(&self, _request: &Request, _reason: ReleaseReason) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connection parameters for building a dupe filter.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub spider_name: String,
    pub jobdir: Option<String>,
    pub redis_url: Option<String>,
    /// Bloom bit-array size as a power-of-two exponent: m = 1 << bit
    pub bloom_bit: u32,
    /// Number of Bloom hash functions
    pub bloom_hashes: u32,
    /// TTL of the in-flight auxiliary set used by retrying variants
    pub inflight_ttl_secs: u64,
}

impl FilterConfig {
    pub fn for_spider(spider_name: impl Into<String>) -> Self {
        Self {
            spider_name: spider_name.into(),
            bloom_bit: 30,
            bloom_hashes: 6,
            inflight_ttl_secs: 180,
            ..Self::default()
        }
    }

    pub fn filter_key(&self) -> String {
        format!("{}:dupefilter", self.spider_name)
    }

    pub fn bloom_key(&self) -> String {
        format!("{}:bloomfilter", self.spider_name)
    }
}

/// Build a dupe filter by registered name.
///
/// Known names: `memory`, `disk`, `redis`, `redis-bloom`, `redis-retry`,
/// `redis-bloom-retry`.
pub async fn build_filter(kind: &str, config: &FilterConfig) -> Result<Arc<dyn DupeFilter>> {
    match kind {
        "memory" => Ok(Arc::new(MemoryDupeFilter::new())),
        "disk" => {
            let jobdir = config.jobdir.as_deref().ok_or_else(|| {
                Error::Config("disk dupe filter requires JOBDIR to be set".into())
            })?;
            Ok(Arc::new(DiskDupeFilter::open(jobdir).await?))
        }
        "redis" => Ok(Arc::new(RedisDupeFilter::connect(
            redis_url(config)?,
            config.filter_key(),
        )?)),
        "redis-retry" => Ok(Arc::new(RetryingRedisDupeFilter::connect(
            redis_url(config)?,
            config.filter_key(),
            config.inflight_ttl_secs,
        )?)),
        "redis-bloom" => Ok(Arc::new(RedisBloomDupeFilter::connect(
            redis_url(config)?,
            config.bloom_key(),
            config.bloom_bit,
            config.bloom_hashes,
        )?)),
        "redis-bloom-retry" => Ok(Arc::new(RetryingRedisBloomDupeFilter::connect(
            redis_url(config)?,
            config.bloom_key(),
            config.bloom_bit,
            config.bloom_hashes,
            config.inflight_ttl_secs,
        )?)),
        other => Err(Error::Config(format!("unknown dupe filter '{}'", other))),
    }
}

fn redis_url(config: &FilterConfig) -> Result<&str> {
    config
        .redis_url
        .as_deref()
        .ok_or_else(|| Error::Config("redis dupe filter requires REDIS_URL to be set".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_builds_memory_filter() {
        let config = FilterConfig::for_spider("test");
        let filter = build_filter("memory", &config).await.unwrap();
        let request = Request::get("https://example.com").unwrap();
        assert!(!filter.seen(&request).await.unwrap());
        assert!(filter.seen(&request).await.unwrap());
    }

    #[tokio::test]
    async fn registry_rejects_unknown_filter() {
        let config = FilterConfig::for_spider("test");
        assert!(build_filter("quantum", &config).await.is_err());
    }

    #[test]
    fn keys_are_namespaced_per_spider() {
        let config = FilterConfig::for_spider("books");
        assert_eq!(config.filter_key(), "books:dupefilter");
        assert_eq!(config.bloom_key(), "books:bloomfilter");
    }
}
