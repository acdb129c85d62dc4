//! The trawler downloader: admits requests under global and per-domain
//! concurrency limits with politeness delays, runs the downloader
//! middleware chain around a pluggable transport, and reports outcomes
//! back to the engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::{mpsc, Semaphore};

use trawler_core::error::Result;
use trawler_core::request::Request;

use trawler_middleware::{DownloaderMiddlewareChain, FetchOutcome, PreFetch};

pub mod mock;
pub mod proxy;
pub mod slot;
pub mod transport;

pub use proxy::{
    ProxyManager, ProxyPool, RedisProxyPool, StaticProxyPool, StopSignal, POOL_EXHAUSTED,
};
pub use slot::{Slot, SlotManager};
pub use transport::{HttpTransport, Transport, TransportRegistry};

/// Concurrency and pacing knobs for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Process-wide in-flight ceiling
    pub concurrent_requests: usize,
    /// Per-domain in-flight ceiling
    pub concurrent_per_domain: usize,
    /// Seconds between consecutive dispatches to one domain
    pub download_delay: f64,
    /// Randomize the delay in [0.5·D, 1.5·D]
    pub randomize_delay: bool,
    /// Ceiling on per-request timeouts, seconds
    pub download_timeout: f64,
    /// Evict slots idle longer than this
    pub slot_idle_age: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            concurrent_requests: 16,
            concurrent_per_domain: 8,
            download_delay: 0.0,
            randomize_delay: true,
            download_timeout: 180.0,
            slot_idle_age: Duration::from_secs(60),
        }
    }
}

/// Terminal outcome of one fetch, delivered to the engine.
#[derive(Debug)]
pub struct DownloadResult {
    /// The request as handed to `fetch`
    pub request: Request,
    pub outcome: FetchOutcome,
}

/// Executes fetches: middleware chain, slot admission, transport dispatch,
/// proxy bookkeeping.
pub struct Downloader {
    config: DownloaderConfig,
    middleware: Arc<DownloaderMiddlewareChain>,
    transports: Arc<TransportRegistry>,
    proxy: Option<Arc<ProxyManager>>,
    slots: SlotManager,
    total: Arc<Semaphore>,
    active: AtomicUsize,
    results: mpsc::Sender<DownloadResult>,
}

impl Downloader {
    pub fn new(
        config: DownloaderConfig,
        middleware: DownloaderMiddlewareChain,
        transports: TransportRegistry,
        proxy: Option<ProxyManager>,
        results: mpsc::Sender<DownloadResult>,
    ) -> Self {
        let slots = SlotManager::new(
            config.concurrent_per_domain,
            config.download_delay,
            config.randomize_delay,
        );
        let total = Arc::new(Semaphore::new(config.concurrent_requests));
        Self {
            config,
            middleware: Arc::new(middleware),
            transports: Arc::new(transports),
            proxy: proxy.map(Arc::new),
            slots,
            total,
            active: AtomicUsize::new(0),
            results,
        }
    }

    /// Requests currently inside the downloader.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0
    }

    /// Whether the engine should stop feeding requests for now.
    pub fn needs_backout(&self) -> bool {
        self.active() >= self.config.concurrent_requests
    }

    /// Dispatch a request. Returns immediately; the outcome arrives on the
    /// result channel once the fetch completes.
    pub fn fetch(self: &Arc<Self>, request: Request) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let downloader = self.clone();
        tokio::spawn(async move {
            let outcome = downloader.run(request.clone()).await;
            // Send before dropping the active count so the engine never
            // observes an idle downloader with an undelivered outcome
            if downloader
                .results
                .send(DownloadResult { request, outcome })
                .await
                .is_err()
            {
                debug!("Engine result channel closed; dropping download outcome");
            }
            downloader.active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn run(&self, request: Request) -> FetchOutcome {
        match self.middleware.pre_fetch(request).await {
            PreFetch::Fetch(request) => self.dispatch(request).await,
            PreFetch::Response(response) => FetchOutcome::Response(response),
            PreFetch::Reschedule(request) => FetchOutcome::Reschedule(request),
            PreFetch::Failure(error) => FetchOutcome::Failure(error),
        }
    }

    /// Slot admission and transport dispatch for a request that passed the
    /// request-side middleware.
    async fn dispatch(&self, mut request: Request) -> FetchOutcome {
        // Global ceiling first, then the per-domain slot
        let _total_permit = self
            .total
            .clone()
            .acquire_owned()
            .await
            .expect("downloader semaphore is never closed");

        let slot = self.slots.slot(&request.slot_key());
        let _slot_permit = slot.acquire().await;
        slot.await_turn().await;

        if let Some(proxy) = &self.proxy {
            if let Err(error) = proxy.attach(&mut request).await {
                return self.middleware.on_exception(&request, error).await;
            }
        }

        let transport = match self.transports.get(request.url.scheme()) {
            Ok(transport) => transport,
            Err(error) => return self.middleware.on_exception(&request, error).await,
        };

        let timeout = request.meta.effective_timeout(self.config.download_timeout);
        let fetched = match tokio::time::timeout(timeout, transport.fetch(&request)).await {
            Ok(result) => result,
            Err(_) => Err(trawler_core::Error::Timeout(timeout)),
        };

        match fetched {
            Ok(response) => {
                if let Some(proxy) = &self.proxy {
                    proxy.check_response(&request, &response).await;
                }
                self.middleware.post_fetch(response).await
            }
            Err(error) => {
                if let Some(proxy) = &self.proxy {
                    proxy.check_error(&request, &error).await;
                }
                self.middleware.on_exception(&request, error).await
            }
        }
    }

    /// Evict slots idle past the configured age. Driven by the engine
    /// heartbeat.
    pub async fn gc_slots(&self) {
        let evicted = self.slots.evict_idle(self.config.slot_idle_age).await;
        if evicted > 0 {
            debug!("Evicted {} idle download slots", evicted);
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.transports.close_all().await;
        if let Some(proxy) = &self.proxy {
            proxy.close().await;
        }
        Ok(())
    }
}
