use std::sync::Arc;

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;

use crate::serializer::{serializer_by_name, JsonSerializer, RequestSerializer};

pub mod disk;
pub mod memory;
pub mod rabbitmq;
pub mod redis;

pub use disk::DiskQueue;
pub use memory::MemoryQueue;
pub use rabbitmq::AmqpQueue;
pub use redis::RedisQueue;

/// Priority-ordered store of pending requests.
///
/// All backends present identical semantics: max-priority ordering with
/// FIFO tie-break, `pop` is non-blocking (the engine's idle detection
/// depends on distinguishing "empty now" from "blocked"), and a pushed
/// request is visible to any worker sharing the backend until exactly one
/// of them pops it.
#[async_trait]
pub trait RequestQueue: Send + Sync + 'static {
    async fn push(&self, request: Request) -> Result<()>;

    /// Highest-priority pending request, or `None` when empty right now.
    async fn pop(&self) -> Result<Option<Request>>;

    /// Advisory size; eventually consistent for shared backends.
    async fn len(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Connection parameters for building a queue backend.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    pub spider_name: String,
    /// Job directory for the disk backend
    pub jobdir: Option<String>,
    /// redis:// URL for the Redis backend
    pub redis_url: Option<String>,
    /// amqp:// URL for the AMQP backend
    pub amqp_url: Option<String>,
    /// Serializer name, "json" by default
    pub serializer: Option<String>,
}

impl QueueConfig {
    pub fn for_spider(spider_name: impl Into<String>) -> Self {
        Self {
            spider_name: spider_name.into(),
            ..Self::default()
        }
    }

    fn serializer(&self) -> Result<Box<dyn RequestSerializer>> {
        match &self.serializer {
            None => Ok(Box::new(JsonSerializer)),
            Some(name) => serializer_by_name(name)
                .ok_or_else(|| Error::Config(format!("unknown serializer '{}'", name))),
        }
    }

    /// Queue key shared by cooperating workers: `{spider}:requests`.
    pub fn queue_key(&self) -> String {
        format!("{}:requests", self.spider_name)
    }
}

/// Build a queue backend by registered name.
///
/// Known names: `memory`, `disk`, `redis`, `amqp`.
pub async fn build_queue(kind: &str, config: &QueueConfig) -> Result<Arc<dyn RequestQueue>> {
    match kind {
        "memory" => Ok(Arc::new(MemoryQueue::new())),
        "disk" => {
            let jobdir = config.jobdir.as_deref().ok_or_else(|| {
                Error::Config("disk queue requires JOBDIR to be set".into())
            })?;
            Ok(Arc::new(
                DiskQueue::open(jobdir, config.serializer()?).await?,
            ))
        }
        "redis" => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                Error::Config("redis queue requires REDIS_URL to be set".into())
            })?;
            Ok(Arc::new(RedisQueue::connect(
                url,
                config.queue_key(),
                config.serializer()?,
            )?))
        }
        "amqp" => {
            let url = config.amqp_url.as_deref().ok_or_else(|| {
                Error::Config("amqp queue requires AMQP_URL to be set".into())
            })?;
            Ok(Arc::new(
                AmqpQueue::connect(url, config.queue_key(), config.serializer()?).await?,
            ))
        }
        other => Err(Error::Config(format!("unknown queue backend '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_builds_memory_queue() {
        let config = QueueConfig::for_spider("test");
        let queue = build_queue("memory", &config).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn registry_rejects_unknown_backend() {
        let config = QueueConfig::for_spider("test");
        assert!(build_queue("carrier-pigeon", &config).await.is_err());
    }

    #[tokio::test]
    async fn disk_backend_requires_jobdir() {
        let config = QueueConfig::for_spider("test");
        assert!(build_queue("disk", &config).await.is_err());
    }

    #[test]
    fn queue_key_is_namespaced_per_spider() {
        let config = QueueConfig::for_spider("books");
        assert_eq!(config.queue_key(), "books:requests");
    }
}
