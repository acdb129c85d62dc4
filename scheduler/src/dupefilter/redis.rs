use deadpool_redis::redis;
use deadpool_redis::{Config, Connection, Pool, Runtime};

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;

use super::{DupeFilter, ReleaseReason};

fn create_pool(url: &str) -> Result<Pool> {
    Config::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| Error::Filter(format!("redis pool: {}", e)))
}

async fn get_connection(pool: &Pool) -> Result<Connection> {
    pool.get()
        .await
        .map_err(|e| Error::Filter(format!("redis connection: {}", e)))
}

/// Shared exact filter on a Redis SET keyed per spider.
///
/// Membership test is SADD, which is an atomic add-if-absent: a return of
/// 0 means some worker already holds the fingerprint.
pub struct RedisDupeFilter {
    pool: Pool,
    key: String,
}

impl RedisDupeFilter {
    pub fn connect(url: &str, key: String) -> Result<Self> {
        Ok(Self {
            pool: create_pool(url)?,
            key,
        })
    }
}

#[async_trait]
impl DupeFilter for RedisDupeFilter {
    async fn seen(&self, request: &Request) -> Result<bool> {
        let mut conn = get_connection(&self.pool).await?;
        let added: i64 = redis::cmd("SADD")
            .arg(&self.key)
            .arg(request.fingerprint())
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("SADD {}: {}", self.key, e)))?;
        Ok(added == 0)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        redis::cmd("DEL")
            .arg(&self.key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("DEL {}: {}", self.key, e)))?;
        Ok(())
    }
}

/// Exact Redis filter that retracts fingerprints when a request fails.
///
/// Alongside the main SET it keeps a short-TTL in-flight SET; a failed
/// request is removed from both so a retry can be scheduled again, while a
/// crashed worker's in-flight entries age out on their own.
pub struct RetryingRedisDupeFilter {
    pool: Pool,
    key: String,
    inflight_key: String,
    ttl_secs: u64,
}

impl RetryingRedisDupeFilter {
    pub fn connect(url: &str, key: String, ttl_secs: u64) -> Result<Self> {
        let inflight_key = format!("{}:inflight", key);
        Ok(Self {
            pool: create_pool(url)?,
            key,
            inflight_key,
            ttl_secs,
        })
    }
}

#[async_trait]
impl DupeFilter for RetryingRedisDupeFilter {
    async fn seen(&self, request: &Request) -> Result<bool> {
        let fp = request.fingerprint();
        let mut conn = get_connection(&self.pool).await?;
        let (added, _inflight_added, _expire): (i64, i64, i64) = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(&self.key)
            .arg(&fp)
            .cmd("SADD")
            .arg(&self.inflight_key)
            .arg(&fp)
            .cmd("EXPIRE")
            .arg(&self.inflight_key)
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("SADD {}: {}", self.key, e)))?;
        Ok(added == 0)
    }

    async fn release(&self, request: &Request, reason: ReleaseReason) -> Result<()> {
        let fp = request.fingerprint();
        let mut conn = get_connection(&self.pool).await?;
        let mut pipe = redis::pipe();
        pipe.cmd("SREM").arg(&self.inflight_key).arg(&fp);
        if reason.is_err() {
            pipe.cmd("SREM").arg(&self.key).arg(&fp);
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("SREM {}: {}", self.key, e)))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        redis::cmd("DEL")
            .arg(&self.key)
            .arg(&self.inflight_key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("DEL {}: {}", self.key, e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        redis::cmd("DEL")
            .arg(&self.inflight_key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("DEL {}: {}", self.inflight_key, e)))?;
        Ok(())
    }
}

/// Bit offsets for a fingerprint under `k` seeded hash functions.
///
/// Each hash folds the bytes as `h = seed * h + byte`, masked to the bit
/// array size, which must be a power of two.
fn bloom_offsets(m: u64, hash_count: u32, value: &str) -> Vec<u64> {
    (0..hash_count)
        .map(|i| {
            let seed = 2 * i as u64 + 3;
            let mut h: u64 = 0;
            for byte in value.bytes() {
                h = h.wrapping_mul(seed).wrapping_add(byte as u64);
            }
            h & (m - 1)
        })
        .collect()
}

/// Shared approximate filter on a Redis bitmap.
///
/// `seen` is a test-and-set over all `k` bits in one pipeline: SETBIT
/// returns the previous bit, so the answer is "seen" iff every bit was
/// already set. False positives occur at the standard Bloom rate for the
/// configured size; false negatives never.
pub struct RedisBloomDupeFilter {
    pool: Pool,
    key: String,
    /// Bit array size, 1 << bit
    m: u64,
    hash_count: u32,
}

impl RedisBloomDupeFilter {
    pub fn connect(url: &str, key: String, bit: u32, hash_count: u32) -> Result<Self> {
        if bit == 0 || bit > 32 {
            return Err(Error::Config(format!(
                "bloom filter exponent must be in 1..=32, got {}",
                bit
            )));
        }
        Ok(Self {
            pool: create_pool(url)?,
            key,
            m: 1u64 << bit,
            hash_count,
        })
    }

    async fn test_and_set(&self, fingerprint: &str) -> Result<bool> {
        let offsets = bloom_offsets(self.m, self.hash_count, fingerprint);
        let mut conn = get_connection(&self.pool).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for offset in &offsets {
            pipe.cmd("SETBIT").arg(&self.key).arg(*offset).arg(1);
        }
        let previous: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("SETBIT {}: {}", self.key, e)))?;
        Ok(previous.iter().all(|bit| *bit == 1))
    }

    async fn test(&self, fingerprint: &str) -> Result<bool> {
        let offsets = bloom_offsets(self.m, self.hash_count, fingerprint);
        let mut conn = get_connection(&self.pool).await?;
        let mut pipe = redis::pipe();
        for offset in &offsets {
            pipe.cmd("GETBIT").arg(&self.key).arg(*offset);
        }
        let bits: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("GETBIT {}: {}", self.key, e)))?;
        Ok(bits.iter().all(|bit| *bit == 1))
    }

    async fn insert(&self, fingerprint: &str) -> Result<()> {
        self.test_and_set(fingerprint).await.map(|_| ())
    }

    async fn delete_key(&self) -> Result<()> {
        let mut conn = get_connection(&self.pool).await?;
        redis::cmd("DEL")
            .arg(&self.key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("DEL {}: {}", self.key, e)))?;
        Ok(())
    }
}

#[async_trait]
impl DupeFilter for RedisBloomDupeFilter {
    async fn seen(&self, request: &Request) -> Result<bool> {
        self.test_and_set(&request.fingerprint()).await
    }

    async fn clear(&self) -> Result<()> {
        self.delete_key().await
    }
}

/// Bloom filter that only commits fingerprints after a successful parse.
///
/// Admission adds the fingerprint to a short-TTL in-flight SET instead of
/// the bitmap; bits cannot be unset, so the bitmap is written only on
/// `release(ParseOk)`. A failed request just drops out of the in-flight
/// set and can re-enter.
pub struct RetryingRedisBloomDupeFilter {
    bloom: RedisBloomDupeFilter,
    inflight_key: String,
    ttl_secs: u64,
}

impl RetryingRedisBloomDupeFilter {
    pub fn connect(
        url: &str,
        key: String,
        bit: u32,
        hash_count: u32,
        ttl_secs: u64,
    ) -> Result<Self> {
        let inflight_key = format!("{}:inflight", key);
        Ok(Self {
            bloom: RedisBloomDupeFilter::connect(url, key, bit, hash_count)?,
            inflight_key,
            ttl_secs,
        })
    }
}

#[async_trait]
impl DupeFilter for RetryingRedisBloomDupeFilter {
    async fn seen(&self, request: &Request) -> Result<bool> {
        let fp = request.fingerprint();
        if self.bloom.test(&fp).await? {
            return Ok(true);
        }
        let mut conn = get_connection(&self.bloom.pool).await?;
        let (added, _expire): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(&self.inflight_key)
            .arg(&fp)
            .cmd("EXPIRE")
            .arg(&self.inflight_key)
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("SADD {}: {}", self.inflight_key, e)))?;
        Ok(added == 0)
    }

    async fn release(&self, request: &Request, reason: ReleaseReason) -> Result<()> {
        let fp = request.fingerprint();
        if reason == ReleaseReason::ParseOk {
            self.bloom.insert(&fp).await?;
        }
        let mut conn = get_connection(&self.bloom.pool).await?;
        redis::cmd("SREM")
            .arg(&self.inflight_key)
            .arg(&fp)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("SREM {}: {}", self.inflight_key, e)))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.bloom.delete_key().await?;
        let mut conn = get_connection(&self.bloom.pool).await?;
        redis::cmd("DEL")
            .arg(&self.inflight_key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("DEL {}: {}", self.inflight_key, e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut conn = get_connection(&self.bloom.pool).await?;
        redis::cmd("DEL")
            .arg(&self.inflight_key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Filter(format!("DEL {}: {}", self.inflight_key, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_offsets_are_stable_and_bounded() {
        let m = 1u64 << 20;
        let a = bloom_offsets(m, 6, "fingerprint-a");
        let b = bloom_offsets(m, 6, "fingerprint-a");
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
        assert!(a.iter().all(|offset| *offset < m));
    }

    #[test]
    fn bloom_offsets_differ_across_values() {
        let m = 1u64 << 20;
        let a = bloom_offsets(m, 6, "fingerprint-a");
        let b = bloom_offsets(m, 6, "fingerprint-b");
        assert_ne!(a, b);
    }

    #[test]
    fn bloom_exponent_is_validated() {
        assert!(RedisBloomDupeFilter::connect(
            "redis://127.0.0.1:6379",
            "test:bloomfilter".into(),
            0,
            6
        )
        .is_err());
        assert!(RedisBloomDupeFilter::connect(
            "redis://127.0.0.1:6379",
            "test:bloomfilter".into(),
            40,
            6
        )
        .is_err());
        assert!(RedisBloomDupeFilter::connect(
            "redis://127.0.0.1:6379",
            "test:bloomfilter".into(),
            30,
            6
        )
        .is_ok());
    }

    // Exercises a live Redis; run with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn exact_filter_against_live_redis() {
        let filter =
            RedisDupeFilter::connect("redis://127.0.0.1:6379/15", "test:dupefilter".into())
                .unwrap();
        filter.clear().await.unwrap();

        let request = Request::get("https://example.com").unwrap();
        assert!(!filter.seen(&request).await.unwrap());
        assert!(filter.seen(&request).await.unwrap());

        filter.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn bloom_filter_against_live_redis() {
        let filter = RedisBloomDupeFilter::connect(
            "redis://127.0.0.1:6379/15",
            "test:bloomfilter".into(),
            20,
            6,
        )
        .unwrap();
        filter.clear().await.unwrap();

        let request = Request::get("https://example.com/bloom").unwrap();
        assert!(!filter.seen(&request).await.unwrap());
        assert!(filter.seen(&request).await.unwrap());

        filter.clear().await.unwrap();
    }
}
