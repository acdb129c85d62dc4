use deadpool_redis::redis;
use deadpool_redis::{Config, Connection, Pool, Runtime};

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;

use super::RequestQueue;
use crate::serializer::RequestSerializer;

/// Shared priority queue on a Redis sorted set.
///
/// Member = serialized request, score = negative priority, so ZPOPMIN
/// yields the highest-priority request. ZPOPMIN is atomic, which gives the
/// no-double-pop guarantee across cooperating workers. FIFO among equal
/// priorities holds per-worker only; cross-worker ordering of ties is
/// unspecified for shared backends.
pub struct RedisQueue {
    pool: Pool,
    key: String,
    serializer: Box<dyn RequestSerializer>,
}

impl RedisQueue {
    pub fn connect(
        url: &str,
        key: String,
        serializer: Box<dyn RequestSerializer>,
    ) -> Result<Self> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Queue(format!("redis pool: {}", e)))?;
        Ok(Self {
            pool,
            key,
            serializer,
        })
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Queue(format!("redis connection: {}", e)))
    }
}

#[async_trait]
impl RequestQueue for RedisQueue {
    async fn push(&self, request: Request) -> Result<()> {
        let payload = self.serializer.serialize(&request)?;
        let score = -(request.priority as f64);
        let mut conn = self.connection().await?;
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg(score)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Queue(format!("ZADD {}: {}", self.key, e)))?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Request>> {
        let mut conn = self.connection().await?;
        let popped: Vec<(Vec<u8>, f64)> = redis::cmd("ZPOPMIN")
            .arg(&self.key)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Queue(format!("ZPOPMIN {}: {}", self.key, e)))?;
        match popped.into_iter().next() {
            Some((payload, _score)) => Ok(Some(self.serializer.deserialize(&payload)?)),
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.connection().await?;
        let count: usize = redis::cmd("ZCARD")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Queue(format!("ZCARD {}: {}", self.key, e)))?;
        Ok(count)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(&self.key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Queue(format!("DEL {}: {}", self.key, e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Pending requests stay in Redis for the next run or other workers.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;

    fn queue_for(url: &str) -> RedisQueue {
        RedisQueue::connect(url, "test:requests".into(), Box::new(JsonSerializer)).unwrap()
    }

    #[test]
    fn connect_accepts_redis_urls() {
        assert!(RedisQueue::connect(
            "redis://127.0.0.1:6379/0",
            "spider:requests".into(),
            Box::new(JsonSerializer)
        )
        .is_ok());
    }

    // Exercises a live Redis; run with `cargo test -- --ignored` when one
    // is available on the default port.
    #[tokio::test]
    #[ignore]
    async fn priority_order_against_live_redis() {
        let queue = queue_for("redis://127.0.0.1:6379/15");
        queue.clear().await.unwrap();

        queue
            .push(Request::get("https://example.com/zero").unwrap())
            .await
            .unwrap();
        queue
            .push(
                Request::get("https://example.com/high")
                    .unwrap()
                    .with_priority(10),
            )
            .await
            .unwrap();

        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(queue.pop().await.unwrap().unwrap().url.path(), "/high");
        assert_eq!(queue.pop().await.unwrap().unwrap().url.path(), "/zero");
        assert!(queue.pop().await.unwrap().is_none());
    }
}
