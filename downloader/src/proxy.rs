use std::collections::VecDeque;

use deadpool_redis::redis;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use log::{info, warn};
use tokio::sync::{mpsc, Mutex};

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;
use trawler_core::response::Response;

/// Failure reason pools report when they run dry. A crawl cannot make
/// progress without proxies, so the manager recognizes this reason and
/// stops the engine instead of letting the retry middleware spin on it.
pub const POOL_EXHAUSTED: &str = "no proxies available";

/// Hook for asking the engine to shut down, satisfied by its close
/// channel.
#[derive(Clone)]
pub struct StopSignal {
    tx: mpsc::Sender<String>,
}

impl StopSignal {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub fn stop(&self, reason: impl Into<String>) {
        let _ = self.tx.try_send(reason.into());
    }
}

/// Supplies proxy URLs to the downloader and retires bad ones.
///
/// Implementations keep a bounded in-process cache rotated round-robin;
/// `get` refills from the upstream source when the cache runs low.
#[async_trait]
pub trait ProxyPool: Send + Sync + 'static {
    /// Next proxy URL, round-robin. Errors when none can be obtained.
    async fn get(&self) -> Result<String>;

    /// Remove a proxy from the cache and the upstream source.
    async fn invalidate(&self, proxy: &str, reason: &str);

    /// Top the cache up from the upstream source.
    async fn refill(&self) -> Result<()>;

    async fn close(&self) {}
}

/// Applies a pool to requests and judges request outcomes against it.
pub struct ProxyManager {
    pool: Box<dyn ProxyPool>,
    /// Statuses that do not count against the proxy (default: 404)
    allow_status: Vec<u16>,
    stop: Option<StopSignal>,
}

impl ProxyManager {
    pub fn new(pool: Box<dyn ProxyPool>, allow_status: Vec<u16>) -> Self {
        Self {
            pool,
            allow_status,
            stop: None,
        }
    }

    /// Wire the engine's close channel in; an exhausted pool then stops
    /// the whole crawl.
    pub fn set_stop_signal(&mut self, signal: StopSignal) {
        self.stop = Some(signal);
    }

    /// Attach a proxy to the request unless it opted out or carries its
    /// own override.
    pub async fn attach(&self, request: &mut Request) -> Result<()> {
        if !request.meta.use_proxy {
            request.meta.proxy = None;
            return Ok(());
        }
        if request.meta.proxy.is_none() {
            match self.pool.get().await {
                Ok(proxy) => request.meta.proxy = Some(proxy),
                Err(error) => {
                    if matches!(&error, Error::Proxy(reason) if reason == POOL_EXHAUSTED) {
                        warn!("Proxy pool exhausted, stopping the crawl");
                        if let Some(stop) = &self.stop {
                            stop.stop(POOL_EXHAUSTED);
                        }
                    }
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Judge a response: 4xx/5xx statuses outside the allow list burn the
    /// proxy that produced them.
    pub async fn check_response(&self, request: &Request, response: &Response) {
        let Some(proxy) = &request.meta.proxy else {
            return;
        };
        if response.status >= 400 && !self.allow_status.contains(&response.status) {
            self.pool
                .invalidate(proxy, &format!("response status {}", response.status))
                .await;
        }
    }

    /// Judge a failure: any transport-level error burns the proxy.
    pub async fn check_error(&self, request: &Request, error: &Error) {
        let Some(proxy) = &request.meta.proxy else {
            return;
        };
        if matches!(
            error,
            Error::Transport { .. } | Error::Timeout(_) | Error::Proxy(_)
        ) {
            self.pool.invalidate(proxy, &error.to_string()).await;
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Fixed proxy list rotated round-robin; for small static setups and tests.
pub struct StaticProxyPool {
    proxies: Mutex<VecDeque<String>>,
}

impl StaticProxyPool {
    pub fn new(proxies: Vec<String>) -> Self {
        Self {
            proxies: Mutex::new(proxies.into_iter().map(normalize_proxy).collect()),
        }
    }
}

#[async_trait]
impl ProxyPool for StaticProxyPool {
    async fn get(&self) -> Result<String> {
        let mut proxies = self.proxies.lock().await;
        let Some(proxy) = proxies.pop_front() else {
            return Err(Error::Proxy(POOL_EXHAUSTED.into()));
        };
        proxies.push_back(proxy.clone());
        Ok(proxy)
    }

    async fn invalidate(&self, proxy: &str, reason: &str) {
        info!("Removing proxy {}: {}", proxy, reason);
        let mut proxies = self.proxies.lock().await;
        proxies.retain(|p| p != proxy);
    }

    async fn refill(&self) -> Result<()> {
        Ok(())
    }
}

/// Pool fed from a Redis sorted set, the canonical proxy list shared by
/// all workers. Invalidation removes the proxy from Redis as well, so one
/// worker's dead proxy is everyone's.
pub struct RedisProxyPool {
    redis: Pool,
    key: String,
    max_count: usize,
    min_count: usize,
    cache: Mutex<VecDeque<String>>,
}

impl RedisProxyPool {
    pub fn connect(url: &str, key: String, max_count: usize, min_count: usize) -> Result<Self> {
        let redis = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Proxy(format!("redis pool: {}", e)))?;
        Ok(Self {
            redis,
            key,
            max_count,
            min_count,
            cache: Mutex::new(VecDeque::new()),
        })
    }

    async fn connection(&self) -> Result<Connection> {
        self.redis
            .get()
            .await
            .map_err(|e| Error::Proxy(format!("redis connection: {}", e)))
    }

    async fn fill_cache(&self, cache: &mut VecDeque<String>) -> Result<()> {
        let want = self.max_count.saturating_sub(cache.len());
        if want == 0 {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(want as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Proxy(format!("ZRANGE {}: {}", self.key, e)))?;

        for member in members {
            let proxy = normalize_proxy(member);
            if !cache.contains(&proxy) {
                cache.push_back(proxy);
            }
        }
        info!("Proxy pool refilled to {} entries", cache.len());
        Ok(())
    }
}

fn normalize_proxy(raw: String) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw
    } else {
        format!("http://{}", raw)
    }
}

#[async_trait]
impl ProxyPool for RedisProxyPool {
    async fn get(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if cache.len() < self.min_count {
            self.fill_cache(&mut cache).await?;
        }
        let Some(proxy) = cache.pop_front() else {
            warn!("No proxies available from {}", self.key);
            return Err(Error::Proxy(POOL_EXHAUSTED.into()));
        };
        cache.push_back(proxy.clone());
        Ok(proxy)
    }

    async fn invalidate(&self, proxy: &str, reason: &str) {
        info!("Removing proxy {}: {}", proxy, reason);
        {
            let mut cache = self.cache.lock().await;
            cache.retain(|p| p != proxy);
        }
        // Also drop it from the canonical pool; both with and without the
        // scheme prefix, matching how it was stored
        let bare = proxy.trim_start_matches("http://");
        if let Ok(mut conn) = self.connection().await {
            let result: std::result::Result<(), _> = redis::cmd("ZREM")
                .arg(&self.key)
                .arg(proxy)
                .arg(bare)
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!("Failed to remove proxy from {}: {}", self.key, e);
            }
        }
    }

    async fn refill(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.fill_cache(&mut cache).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawler_core::headers::Headers;

    fn manager_with(proxies: Vec<&str>) -> ProxyManager {
        ProxyManager::new(
            Box::new(StaticProxyPool::new(
                proxies.into_iter().map(String::from).collect(),
            )),
            vec![404],
        )
    }

    #[tokio::test]
    async fn static_pool_rotates_round_robin() {
        let pool = StaticProxyPool::new(vec!["1.2.3.4:8080".into(), "http://5.6.7.8:3128".into()]);

        assert_eq!(pool.get().await.unwrap(), "http://1.2.3.4:8080");
        assert_eq!(pool.get().await.unwrap(), "http://5.6.7.8:3128");
        assert_eq!(pool.get().await.unwrap(), "http://1.2.3.4:8080");
    }

    #[tokio::test]
    async fn invalidate_removes_from_rotation() {
        let pool = StaticProxyPool::new(vec!["http://a:1".into(), "http://b:2".into()]);
        pool.invalidate("http://a:1", "test").await;

        assert_eq!(pool.get().await.unwrap(), "http://b:2");
        assert_eq!(pool.get().await.unwrap(), "http://b:2");
    }

    #[tokio::test]
    async fn empty_pool_errors_with_exhausted_reason() {
        let pool = StaticProxyPool::new(Vec::new());
        match pool.get().await {
            Err(Error::Proxy(reason)) => assert_eq!(reason, POOL_EXHAUSTED),
            other => panic!("expected proxy error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exhausted_pool_stops_the_crawl() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut manager = manager_with(vec![]);
        manager.set_stop_signal(StopSignal::new(tx));

        let mut request = Request::get("https://example.com").unwrap();
        assert!(manager.attach(&mut request).await.is_err());

        assert_eq!(rx.try_recv().ok().as_deref(), Some(POOL_EXHAUSTED));
    }

    #[tokio::test]
    async fn transient_pool_errors_do_not_stop_the_crawl() {
        struct FlakyPool;

        #[async_trait]
        impl ProxyPool for FlakyPool {
            async fn get(&self) -> Result<String> {
                Err(Error::Proxy("redis connection: refused".into()))
            }

            async fn invalidate(&self, _proxy: &str, _reason: &str) {}

            async fn refill(&self) -> Result<()> {
                Ok(())
            }
        }

        let (tx, mut rx) = mpsc::channel(4);
        let mut manager = ProxyManager::new(Box::new(FlakyPool), vec![404]);
        manager.set_stop_signal(StopSignal::new(tx));

        let mut request = Request::get("https://example.com").unwrap();
        assert!(manager.attach(&mut request).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn attach_respects_use_proxy_and_overrides() {
        let manager = manager_with(vec!["http://a:1"]);

        let mut request = Request::get("https://example.com").unwrap();
        manager.attach(&mut request).await.unwrap();
        assert_eq!(request.meta.proxy.as_deref(), Some("http://a:1"));

        let mut opted_out = Request::get("https://example.com").unwrap();
        opted_out.meta.use_proxy = false;
        manager.attach(&mut opted_out).await.unwrap();
        assert!(opted_out.meta.proxy.is_none());

        let mut pinned = Request::get("https://example.com")
            .unwrap()
            .with_proxy("http://pinned:9");
        manager.attach(&mut pinned).await.unwrap();
        assert_eq!(pinned.meta.proxy.as_deref(), Some("http://pinned:9"));
    }

    #[tokio::test]
    async fn bad_status_burns_the_proxy_but_allowed_does_not() {
        let manager = manager_with(vec!["http://a:1"]);

        let mut request = Request::get("https://example.com").unwrap();
        manager.attach(&mut request).await.unwrap();

        // 404 is allowed by default and keeps the proxy alive
        let not_found = Response::new(request.clone(), 404, Headers::new(), Vec::new());
        manager.check_response(&request, &not_found).await;
        assert_eq!(manager.pool.get().await.unwrap(), "http://a:1");

        // 403 burns it
        let forbidden = Response::new(request.clone(), 403, Headers::new(), Vec::new());
        manager.check_response(&request, &forbidden).await;
        assert!(manager.pool.get().await.is_err());
    }

    #[tokio::test]
    async fn transport_errors_burn_the_proxy() {
        let manager = manager_with(vec!["http://a:1"]);
        let mut request = Request::get("https://example.com").unwrap();
        manager.attach(&mut request).await.unwrap();

        manager
            .check_error(&request, &Error::transport("connection reset"))
            .await;
        assert!(manager.pool.get().await.is_err());
    }

    #[tokio::test]
    async fn parse_errors_do_not_burn_the_proxy() {
        let manager = manager_with(vec!["http://a:1"]);
        let mut request = Request::get("https://example.com").unwrap();
        manager.attach(&mut request).await.unwrap();

        manager
            .check_error(&request, &Error::Parse("bad html".into()))
            .await;
        assert!(manager.pool.get().await.is_ok());
    }
}
