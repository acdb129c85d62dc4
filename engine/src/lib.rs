//! The trawler engine: the heartbeat loop that drives a crawl end to end.
//!
//! Each tick reaps completed downloads, hands them to the scraper, routes
//! the scraper's outputs (requests to the scheduler, items through the
//! pipelines), refills the downloader from the scheduler, and evaluates
//! idle and close conditions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;

use trawler_core::error::{Error, Result};
use trawler_core::request::Request;
use trawler_core::settings::Settings;
use trawler_core::signal::{Signal, SignalArgs};
use trawler_core::spider::Spider;
use trawler_core::stats::keys;

use trawler_downloader::{
    Downloader, DownloaderConfig, DownloadResult, ProxyManager, RedisProxyPool, StopSignal,
    TransportRegistry,
};
use trawler_middleware::{
    DefaultHeadersMiddleware, DepthMiddleware, DownloadTimeoutMiddleware,
    DownloaderMiddleware, DownloaderMiddlewareChain, FetchOutcome, HttpErrorMiddleware,
    RetryMiddleware, SpiderMiddleware, SpiderMiddlewareChain,
};
use trawler_pipeline::{Pipeline, PipelineChain};
use trawler_scheduler::{
    build_filter, build_queue, DupeFilter, FilterConfig, QueueConfig, ReleaseReason,
    RequestQueue, Scheduler,
};

pub mod config;
pub mod context;
pub mod scraper;

pub use config::EngineConfig;
pub use context::CrawlerContext;
pub use scraper::{Scraper, ScrapeSummary};

/// How the crawl ended, with the final counters.
#[derive(Debug)]
pub struct CrawlReport {
    pub finish_reason: String,
    pub elapsed: Duration,
    pub stats: BTreeMap<String, i64>,
}

/// Remote control for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    close_tx: mpsc::Sender<String>,
}

impl EngineHandle {
    /// Ask the engine to shut down gracefully.
    pub fn stop(&self, reason: impl Into<String>) {
        let _ = self.close_tx.try_send(reason.into());
    }
}

/// The crawl driver. Owns the scheduler, downloader and scraper for its
/// lifetime; everything else reaches it through [`EngineHandle`] or
/// signals.
pub struct Engine {
    context: Arc<CrawlerContext>,
    spider: Arc<dyn Spider>,
    scheduler: Arc<Scheduler>,
    downloader: Arc<Downloader>,
    scraper: Arc<Scraper>,
    config: EngineConfig,
    results_rx: mpsc::Receiver<DownloadResult>,
    close_rx: mpsc::Receiver<String>,
    close_tx: mpsc::Sender<String>,
    start_requests: VecDeque<Request>,
}

impl Engine {
    pub fn builder(spider: Arc<dyn Spider>) -> EngineBuilder {
        EngineBuilder::new(spider)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            close_tx: self.close_tx.clone(),
        }
    }

    pub fn context(&self) -> Arc<CrawlerContext> {
        self.context.clone()
    }

    /// Run the crawl to completion and report how it ended.
    pub async fn run(mut self) -> Result<CrawlReport> {
        let started = Instant::now();
        let signals = self.context.signals.clone();

        info!("Engine started for spider '{}'", self.context.spider_name);
        signals
            .send_catch_log(Signal::EngineStarted, SignalArgs::None)
            .await;

        self.scheduler.open(self.config.flush_on_start).await?;
        self.scraper.open().await?;
        signals
            .send_catch_log(Signal::SpiderOpened, SignalArgs::None)
            .await;

        self.start_requests = self.spider.start_requests()?.into();

        let mut was_idle = false;
        let mut ticks: u64 = 0;
        let reason = loop {
            // 1. Reap completed downloads and run them through the scraper
            while let Ok(result) = self.results_rx.try_recv() {
                self.handle_download_result(result).await;
            }

            // 2. Close triggers
            if let Some(reason) = self.close_reason(started) {
                break reason;
            }

            // 3. Refill the in-flight pool
            if let Err(e) = self.refill().await {
                error!("Scheduler failure during refill: {}", e);
                self.context.stats.inc(keys::ERROR_COUNT);
            }

            // 4. Idle detection. Closing requires idleness to persist
            // across one further tick so an idle handler gets the chance
            // to repopulate the queue first.
            if self.is_idle().await {
                if was_idle && self.config.close_on_idle {
                    break "finished".to_string();
                }
                signals
                    .send_catch_log(Signal::SpiderIdle, SignalArgs::None)
                    .await;
                was_idle = true;
            } else {
                was_idle = false;
            }

            ticks += 1;
            if ticks % 1024 == 0 {
                self.downloader.gc_slots().await;
            }

            tokio::select! {
                _ = sleep(self.config.tick_interval) => {}
                Some(reason) = self.close_rx.recv() => break reason,
            }
        };

        self.shutdown(reason, started).await
    }

    /// Feed the downloader until a limit bites: its concurrency ceiling,
    /// scraper backpressure, or queue exhaustion. Start requests enter the
    /// scheduler here, a few per tick, rather than all at once.
    async fn refill(&mut self) -> Result<()> {
        let mut budget = 128usize;
        while budget > 0 && !self.downloader.needs_backout() && !self.scraper.needs_backout() {
            budget -= 1;
            // Seed from the start requests first so their priorities are
            // honoured against each other before anything is popped
            if let Some(request) = self.start_requests.pop_front() {
                if let Err(e) = self.schedule(request).await {
                    error!("Failed to schedule start request: {}", e);
                    self.context.stats.inc(keys::ERROR_COUNT);
                }
                continue;
            }
            match self.scheduler.next().await? {
                Some(request) => self.downloader.fetch(request),
                None => break,
            }
        }
        Ok(())
    }

    /// Enqueue a request, emitting `request_scheduled` or
    /// `request_dropped`.
    async fn schedule(&self, request: Request) -> Result<bool> {
        let accepted = self.scheduler.enqueue(request.clone()).await?;
        if accepted {
            self.context
                .signals
                .send_catch_log(
                    Signal::RequestScheduled,
                    SignalArgs::Request(Box::new(request)),
                )
                .await;
        } else {
            self.context
                .signals
                .send_catch_log(
                    Signal::RequestDropped,
                    SignalArgs::Dropped {
                        request: Box::new(request),
                        reason: "duplicate".into(),
                    },
                )
                .await;
        }
        Ok(accepted)
    }

    /// Like [`Engine::schedule`] but backend failures only cost the one
    /// request.
    async fn schedule_lossy(&self, request: Request) {
        let url = request.url.clone();
        if let Err(e) = self.schedule(request).await {
            error!("Dropping request {} on scheduler failure: {}", url, e);
            self.context.stats.inc(keys::ERROR_COUNT);
        }
    }

    async fn handle_download_result(&mut self, result: DownloadResult) {
        let DownloadResult { request, outcome } = result;
        let signals = self.context.signals.clone();

        match outcome {
            FetchOutcome::Response(response) => {
                self.context.stats.inc(keys::RESPONSE_COUNT);
                self.context.stats.inc(keys::RESPONSE_RECEIVED);
                signals
                    .send_catch_log(
                        Signal::ResponseDownloaded,
                        SignalArgs::Response(Box::new(response.clone())),
                    )
                    .await;
                signals
                    .send_catch_log(
                        Signal::ResponseReceived,
                        SignalArgs::Response(Box::new(response.clone())),
                    )
                    .await;

                let summary = self.scraper.scrape_response(response).await;
                for request in summary.requests {
                    self.schedule_lossy(request).await;
                }
                let release = if summary.parse_ok {
                    ReleaseReason::ParseOk
                } else {
                    ReleaseReason::ParseErr
                };
                if let Err(e) = self.scheduler.release(&request, release).await {
                    warn!("Dupe filter release failed for {}: {}", request.url, e);
                }
            }
            FetchOutcome::Reschedule(retry) => {
                debug!("Re-enqueueing {} (middleware verdict)", retry.url);
                self.schedule_lossy(retry).await;
            }
            FetchOutcome::Failure(error) => {
                self.context.stats.inc(keys::ERROR_COUNT);
                let summary = self.scraper.scrape_failure(request.clone(), error).await;
                for request in summary.requests {
                    self.schedule_lossy(request).await;
                }
                if let Err(e) = self
                    .scheduler
                    .release(&request, ReleaseReason::RequestErr)
                    .await
                {
                    warn!("Dupe filter release failed for {}: {}", request.url, e);
                }
            }
        }
    }

    /// Idle means: no start requests left, nothing pending in the
    /// scheduler, nothing in flight in the downloader, no scraper work,
    /// and no undelivered download outcomes.
    async fn is_idle(&self) -> bool {
        if !self.start_requests.is_empty() {
            return false;
        }
        if !self.downloader.is_idle() || !self.scraper.is_idle() {
            return false;
        }
        if !self.results_rx.is_empty() {
            return false;
        }
        match self.scheduler.has_pending().await {
            Ok(pending) => !pending,
            Err(e) => {
                warn!("Scheduler has_pending failed: {}", e);
                false
            }
        }
    }

    fn close_reason(&self, started: Instant) -> Option<String> {
        if let Some(timeout) = self.config.closespider_timeout {
            if started.elapsed() >= timeout {
                return Some("closespider_timeout".into());
            }
        }
        let stats = &self.context.stats;
        if self.config.closespider_itemcount > 0
            && stats.get(keys::ITEM_SCRAPED) as u64 >= self.config.closespider_itemcount
        {
            return Some("closespider_itemcount".into());
        }
        if self.config.closespider_pagecount > 0
            && stats.get(keys::RESPONSE_RECEIVED) as u64 >= self.config.closespider_pagecount
        {
            return Some("closespider_pagecount".into());
        }
        if self.config.closespider_errorcount > 0
            && stats.get(keys::ERROR_COUNT) as u64 >= self.config.closespider_errorcount
        {
            return Some("closespider_errorcount".into());
        }
        None
    }

    async fn shutdown(mut self, reason: String, started: Instant) -> Result<CrawlReport> {
        info!(
            "Closing spider '{}' ({})",
            self.context.spider_name, reason
        );

        // Drain in-flight downloads and scraper work within the grace
        // period; their outcomes still route, but nothing new is fetched.
        let deadline = Instant::now() + self.config.graceful_timeout;
        loop {
            while let Ok(result) = self.results_rx.try_recv() {
                self.handle_download_result(result).await;
            }
            let drained = self.downloader.is_idle()
                && self.scraper.is_idle()
                && self.results_rx.is_empty();
            if drained || Instant::now() >= deadline {
                break;
            }
            sleep(self.config.tick_interval).await;
        }
        if !self.downloader.is_idle() {
            warn!(
                "Graceful deadline expired with {} downloads in flight",
                self.downloader.active()
            );
        }

        let signals = self.context.signals.clone();
        if let Err(e) = self.scraper.close().await {
            error!("Pipeline close failure: {}", e);
        }
        if let Err(e) = self.downloader.close().await {
            error!("Downloader close failure: {}", e);
        }
        if let Err(e) = self.scheduler.close(&reason).await {
            error!("Scheduler close failure: {}", e);
        }

        self.context
            .stats
            .set_value(keys::FINISH_REASON, reason.clone());
        signals
            .send_catch_log(Signal::SpiderClosed, SignalArgs::Reason(reason.clone()))
            .await;
        self.spider.closed(&reason).await;
        signals
            .send_catch_log(Signal::EngineStopped, SignalArgs::None)
            .await;

        let stats = self.context.stats.snapshot();
        let elapsed = started.elapsed();
        info!(
            "Spider '{}' closed ({}) after {:.2}s: {} responses, {} items, {} errors",
            self.context.spider_name,
            reason,
            elapsed.as_secs_f64(),
            self.context.stats.get(keys::RESPONSE_RECEIVED),
            self.context.stats.get(keys::ITEM_SCRAPED),
            self.context.stats.get(keys::ERROR_COUNT),
        );

        Ok(CrawlReport {
            finish_reason: reason,
            elapsed,
            stats,
        })
    }
}

/// Wires an engine from settings plus optional component overrides.
///
/// Components not supplied explicitly are built from the registries using
/// the settings keys (`SCHEDULER_QUEUE_CLASS`, `DUPEFILTER_CLASS`, ...).
pub struct EngineBuilder {
    spider: Arc<dyn Spider>,
    settings: Settings,
    queue: Option<Arc<dyn RequestQueue>>,
    filter: Option<Arc<dyn DupeFilter>>,
    disable_dupefilter: bool,
    transports: Option<TransportRegistry>,
    downloader_middleware: Vec<Arc<dyn DownloaderMiddleware>>,
    default_middleware: bool,
    spider_middleware: Vec<Arc<dyn SpiderMiddleware>>,
    pipelines: Vec<Arc<dyn Pipeline>>,
    proxy: Option<ProxyManager>,
}

impl EngineBuilder {
    pub fn new(spider: Arc<dyn Spider>) -> Self {
        Self {
            spider,
            settings: Settings::defaults(),
            queue: None,
            filter: None,
            disable_dupefilter: false,
            transports: None,
            downloader_middleware: Vec::new(),
            default_middleware: true,
            spider_middleware: Vec::new(),
            pipelines: Vec::new(),
            proxy: None,
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn queue(mut self, queue: Arc<dyn RequestQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn dupefilter(mut self, filter: Arc<dyn DupeFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Run without any dupe filter; every request is admitted.
    pub fn no_dupefilter(mut self) -> Self {
        self.disable_dupefilter = true;
        self
    }

    pub fn transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = Some(transports);
        self
    }

    pub fn add_downloader_middleware(
        mut self,
        middleware: Arc<dyn DownloaderMiddleware>,
    ) -> Self {
        self.downloader_middleware.push(middleware);
        self
    }

    /// Skip the built-in middleware stack (headers, timeout, retry, depth,
    /// httperror); only explicitly added middleware runs.
    pub fn bare_middleware(mut self) -> Self {
        self.default_middleware = false;
        self
    }

    pub fn add_spider_middleware(mut self, middleware: Arc<dyn SpiderMiddleware>) -> Self {
        self.spider_middleware.push(middleware);
        self
    }

    pub fn add_pipeline(mut self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn proxy(mut self, proxy: ProxyManager) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let spider_name = self.spider.name().to_string();
        let context = CrawlerContext::new(spider_name.clone(), self.settings);
        let settings = context.settings.clone();

        // Scheduler: queue and filter from the registries unless overridden
        let queue = match self.queue {
            Some(queue) => queue,
            None => {
                let mut queue_config = QueueConfig::for_spider(&spider_name);
                queue_config.jobdir = settings.get_str("JOBDIR").map(String::from);
                queue_config.redis_url = settings.get_str("REDIS_URL").map(String::from);
                queue_config.amqp_url = settings.get_str("AMQP_URL").map(String::from);
                queue_config.serializer =
                    settings.get_str("SCHEDULER_SERIALIZER").map(String::from);
                let kind = settings.get_str("SCHEDULER_QUEUE_CLASS").unwrap_or("memory");
                build_queue(kind, &queue_config).await?
            }
        };
        let filter = if self.disable_dupefilter {
            None
        } else {
            match self.filter {
                Some(filter) => Some(filter),
                None => {
                    let mut filter_config = FilterConfig::for_spider(&spider_name);
                    filter_config.jobdir = settings.get_str("JOBDIR").map(String::from);
                    filter_config.redis_url = settings.get_str("REDIS_URL").map(String::from);
                    filter_config.bloom_bit = settings.get_u64("BLOOMFILTER_BIT") as u32;
                    filter_config.bloom_hashes =
                        settings.get_u64("BLOOMFILTER_HASH_NUMBER") as u32;
                    filter_config.inflight_ttl_secs =
                        settings.get_u64("DUPEFILTER_INFLIGHT_TTL");
                    let kind = settings.get_str("DUPEFILTER_CLASS").unwrap_or("memory");
                    Some(build_filter(kind, &filter_config).await?)
                }
            }
        };
        let scheduler = Arc::new(Scheduler::new(
            queue,
            filter,
            context.stats.clone(),
            settings.get_bool("SCHEDULER_PERSIST"),
        ));

        // Downloader middleware: built-ins ordered by their priorities
        let mut middleware = self.downloader_middleware;
        if self.default_middleware {
            middleware.push(Arc::new(DownloadTimeoutMiddleware::new(
                settings.get_f64("DOWNLOAD_TIMEOUT"),
            )));
            let user_agent = settings.get_str("USER_AGENT").unwrap_or("trawler").to_string();
            let headers = match settings.get("DEFAULT_REQUEST_HEADERS") {
                Some(trawler_core::serde_json::Value::Object(map)) => {
                    let mut headers: Vec<(String, String)> = map
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect();
                    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
                        headers.push(("User-Agent".into(), user_agent.clone()));
                    }
                    Some(headers)
                }
                _ => None,
            };
            match headers {
                Some(headers) => {
                    middleware.push(Arc::new(DefaultHeadersMiddleware::new(headers)))
                }
                None => middleware.push(Arc::new(DefaultHeadersMiddleware::common(&user_agent))),
            }
            if settings.get_bool("RETRY_ENABLED") {
                middleware.push(Arc::new(RetryMiddleware::new(
                    settings.get_u16_list("RETRY_HTTP_CODES"),
                    settings.get_u64("RETRY_TIMES") as u32,
                    settings.get_i64("RETRY_PRIORITY_ADJUST"),
                    context.stats.clone(),
                )));
            }
        }
        let chain = DownloaderMiddlewareChain::new(middleware);

        let transports = match self.transports {
            Some(transports) => transports,
            None => {
                let user_agent = settings.get_str("USER_AGENT").unwrap_or("trawler");
                TransportRegistry::http(user_agent)?
            }
        };

        // Created here so the proxy manager can ask the engine to stop
        // when its pool runs dry
        let (close_tx, close_rx) = mpsc::channel(4);

        let proxy = match self.proxy {
            Some(mut proxy) => {
                proxy.set_stop_signal(StopSignal::new(close_tx.clone()));
                Some(proxy)
            }
            None if settings.get_bool("USE_PROXY") => {
                let redis_url = settings.get_str("REDIS_URL").ok_or_else(|| {
                    Error::Config("USE_PROXY requires REDIS_URL to be set".into())
                })?;
                let proxy_key = settings.get_str("PROXY_KEY").ok_or_else(|| {
                    Error::Config("USE_PROXY requires PROXY_KEY to be set".into())
                })?;
                let pool = RedisProxyPool::connect(
                    redis_url,
                    proxy_key.to_string(),
                    settings.get_u64("PROXY_MAX_COUNT") as usize,
                    settings.get_u64("PROXY_MIN_COUNT") as usize,
                )?;
                let mut manager = ProxyManager::new(
                    Box::new(pool),
                    settings.get_u16_list("PROXY_ALLOW_STATUS_CODE"),
                );
                manager.set_stop_signal(StopSignal::new(close_tx.clone()));
                Some(manager)
            }
            None => None,
        };

        let downloader_config = DownloaderConfig {
            concurrent_requests: settings.get_u64("CONCURRENT_REQUESTS").max(1) as usize,
            concurrent_per_domain: settings
                .get_u64("CONCURRENT_REQUESTS_PER_DOMAIN")
                .max(1) as usize,
            download_delay: settings.get_f64("DOWNLOAD_DELAY"),
            randomize_delay: settings.get_bool("RANDOMIZE_DOWNLOAD_DELAY"),
            download_timeout: settings.get_f64("DOWNLOAD_TIMEOUT"),
            ..DownloaderConfig::default()
        };
        let (results_tx, results_rx) =
            mpsc::channel(downloader_config.concurrent_requests.max(16) * 2);
        let downloader = Arc::new(Downloader::new(
            downloader_config,
            chain,
            transports,
            proxy,
            results_tx,
        ));

        // Spider middleware: httperror low, depth high, per their priorities
        let mut spider_middleware = self.spider_middleware;
        if self.default_middleware {
            spider_middleware.push(Arc::new(HttpErrorMiddleware::new(
                settings.get_u16_list("HTTPERROR_ALLOWED_CODES"),
            )));
            spider_middleware.push(Arc::new(DepthMiddleware::new(
                settings.get_u64("DEPTH_LIMIT") as u32,
                settings.get_i64("DEPTH_PRIORITY"),
                context.stats.clone(),
            )));
        }

        let scraper = Arc::new(Scraper::new(
            context.clone(),
            self.spider.clone(),
            SpiderMiddlewareChain::new(spider_middleware),
            PipelineChain::new(self.pipelines),
            settings.get_u64("CONCURRENT_PARSER").max(1) as usize,
            settings.get_u64("SCRAPER_SLOT_MAX_ACTIVE_SIZE") as usize,
        ));

        Ok(Engine {
            config: EngineConfig::from_settings(&settings),
            context,
            spider: self.spider,
            scheduler,
            downloader,
            scraper,
            results_rx,
            close_rx,
            close_tx,
            start_requests: VecDeque::new(),
        })
    }
}
