use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use log::{error, warn};
use tokio::sync::Semaphore;

use trawler_core::error::{Error, Result};
use trawler_core::request::Request;
use trawler_core::response::Response;
use trawler_core::signal::{Signal, SignalArgs};
use trawler_core::spider::{ParseEntry, Spider};
use trawler_core::stats::keys;

use trawler_middleware::SpiderMiddlewareChain;
use trawler_pipeline::{PipelineChain, PipelineVerdict};

use crate::context::CrawlerContext;

/// Responses below this size still count this many bytes against the
/// scraper's memory budget.
const MIN_RESPONSE_SIZE: usize = 1024;

/// What one parser invocation produced, after classification.
#[derive(Debug, Default)]
pub struct ScrapeSummary {
    /// Follow-up requests for the scheduler
    pub requests: Vec<Request>,
    /// Whether the parser (or errback) completed without error
    pub parse_ok: bool,
    pub items: u64,
}

/// Wraps downloader outcomes in spider-middleware processing, invokes the
/// parser, and classifies its outputs: requests go back to the engine,
/// items go through the pipeline chain, anything reaching the parser's
/// error path goes to the errback.
pub struct Scraper {
    context: Arc<CrawlerContext>,
    spider: Arc<dyn Spider>,
    middleware: SpiderMiddlewareChain,
    pipelines: PipelineChain,
    /// Bounds concurrent parser invocations
    parser_gate: Semaphore,
    /// Responses currently being scraped
    active: AtomicUsize,
    /// Bytes of response bodies currently held
    active_size: AtomicUsize,
    max_active_size: usize,
}

impl Scraper {
    pub fn new(
        context: Arc<CrawlerContext>,
        spider: Arc<dyn Spider>,
        middleware: SpiderMiddlewareChain,
        pipelines: PipelineChain,
        concurrent_parsers: usize,
        max_active_size: usize,
    ) -> Self {
        Self {
            context,
            spider,
            middleware,
            pipelines,
            parser_gate: Semaphore::new(concurrent_parsers.max(1)),
            active: AtomicUsize::new(0),
            active_size: AtomicUsize::new(0),
            max_active_size,
        }
    }

    pub async fn open(&self) -> Result<()> {
        self.pipelines.open(&self.context.spider_name).await
    }

    pub async fn close(&self) -> Result<()> {
        self.pipelines.close(&self.context.spider_name).await
    }

    pub fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0
    }

    /// Memory backpressure: the engine stops feeding the downloader while
    /// the scraper holds too many response bytes.
    pub fn needs_backout(&self) -> bool {
        self.active_size.load(Ordering::SeqCst) > self.max_active_size
    }

    /// Scrape a downloaded response: spider middleware in, parser, spider
    /// middleware out, then classification.
    pub async fn scrape_response(&self, response: Response) -> ScrapeSummary {
        let size = response.body.len().max(MIN_RESPONSE_SIZE);
        self.active.fetch_add(1, Ordering::SeqCst);
        self.active_size.fetch_add(size, Ordering::SeqCst);

        let summary = self.scrape_inner(response).await;

        self.active_size.fetch_sub(size, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        summary
    }

    async fn scrape_inner(&self, response: Response) -> ScrapeSummary {
        let _parser_permit = self
            .parser_gate
            .acquire()
            .await
            .expect("parser gate is never closed");

        // Spider-middleware input hooks may reject the response outright
        if let Err(error) = self.middleware.process_input(&response).await {
            let request = response.request.clone();
            return self.run_errback(request, error, true).await;
        }

        let request = response.request.clone();
        let entries = match self.invoke_parser(&request, response.clone()).await {
            Ok(entries) => entries,
            Err(error) => {
                self.record_spider_error(&error);
                // Offer the failure to the middleware before the errback
                match self.middleware.process_exception(&response, &error).await {
                    Some(recovered) => {
                        let mut summary = self.route_entries(&response, recovered).await;
                        summary.parse_ok = false;
                        return summary;
                    }
                    None => return self.run_errback(request, error, false).await,
                }
            }
        };

        let entries = match self.middleware.process_output(&response, entries).await {
            Ok(entries) => entries,
            Err(error) => {
                self.record_spider_error(&error);
                return self.run_errback(request, error, false).await;
            }
        };

        let mut summary = self.route_entries(&response, entries).await;
        summary.parse_ok = true;
        summary
    }

    /// Handle a terminally failed request: the errback runs and its
    /// outputs are routed like parser outputs.
    pub async fn scrape_failure(&self, request: Request, error: Error) -> ScrapeSummary {
        self.active.fetch_add(1, Ordering::SeqCst);
        let summary = self.run_errback(request, error, false).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        summary
    }

    async fn invoke_parser(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<Vec<ParseEntry>> {
        let mut stream = match &request.callback {
            Some(name) => self.spider.dispatch(name, response).await?,
            None => self.spider.parse(response).await?,
        };

        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Invoke the errback and route whatever it produces.
    ///
    /// `input_rejected` marks responses the spider middleware refused;
    /// those completed their fetch, so the parse still counts as ok for
    /// fingerprint-release purposes.
    async fn run_errback(
        &self,
        request: Request,
        error: Error,
        input_rejected: bool,
    ) -> ScrapeSummary {
        self.context
            .signals
            .send_catch_log(Signal::SpiderError, SignalArgs::Error(error.to_string()))
            .await;

        let entries = match self.spider.errback(request.clone(), &error).await {
            Ok(mut stream) => {
                let mut entries = Vec::new();
                loop {
                    match stream.next().await {
                        Some(Ok(entry)) => entries.push(entry),
                        Some(Err(errback_error)) => {
                            error!(
                                "Errback of {} failed as well: {}",
                                request.url, errback_error
                            );
                            self.record_spider_error(&errback_error);
                            break;
                        }
                        None => break,
                    }
                }
                entries
            }
            Err(errback_error) => {
                error!("Errback of {} failed: {}", request.url, errback_error);
                self.record_spider_error(&errback_error);
                Vec::new()
            }
        };

        // Errback entries have no response to route against; classify
        // directly
        let mut summary = ScrapeSummary {
            parse_ok: input_rejected,
            ..ScrapeSummary::default()
        };
        for entry in entries {
            self.classify(entry, &mut summary).await;
        }
        summary
    }

    /// Run classified routing for parser output entries.
    async fn route_entries(
        &self,
        _response: &Response,
        entries: Vec<ParseEntry>,
    ) -> ScrapeSummary {
        let mut summary = ScrapeSummary::default();
        for entry in entries {
            self.classify(entry, &mut summary).await;
        }
        summary
    }

    async fn classify(&self, entry: ParseEntry, summary: &mut ScrapeSummary) {
        match entry {
            ParseEntry::Request(request) => summary.requests.push(request),
            ParseEntry::Item(item) => {
                summary.items += 1;
                self.process_item(item).await;
            }
        }
    }

    async fn process_item(&self, item: trawler_core::item::Item) {
        match self
            .pipelines
            .process_item(item.clone(), &self.context.spider_name)
            .await
        {
            Ok(PipelineVerdict::Keep(kept)) => {
                self.context.stats.inc(keys::ITEM_SCRAPED);
                self.context
                    .signals
                    .send_catch_log(Signal::ItemScraped, SignalArgs::Item(Box::new(kept)))
                    .await;
            }
            Ok(PipelineVerdict::Drop(reason)) => {
                self.context.stats.inc(keys::ITEM_DROPPED);
                self.context
                    .signals
                    .send_catch_log(Signal::ItemDropped, SignalArgs::Reason(reason))
                    .await;
            }
            Err(error) => {
                // A failing pipeline loses only this item
                warn!("Pipeline error, item lost: {}", error);
                self.context.stats.inc(keys::ITEM_ERROR);
            }
        }
    }

    fn record_spider_error(&self, error: &Error) {
        error!("Spider '{}' error: {}", self.context.spider_name, error);
        self.context.stats.inc(keys::SPIDER_EXCEPTIONS);
    }
}
