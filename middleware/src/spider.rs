use std::sync::Arc;

use log::debug;

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::response::Response;
use trawler_core::spider::ParseEntry;
use trawler_core::stats::{keys, StatsCollector};

/// A hook around parser invocation.
///
/// Input hooks run in priority order before the parser; output hooks run in
/// reverse order over the parser's entries. Rejecting the input routes the
/// response to the request's errback instead of its callback.
#[async_trait]
pub trait SpiderMiddleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        500
    }

    /// Inspect a response before the parser sees it; `Err` rejects it.
    async fn process_spider_input(&self, _response: &Response) -> Result<()> {
        Ok(())
    }

    /// Transform the parser's entries; runs once per parser invocation.
    async fn process_spider_output(
        &self,
        _response: &Response,
        entries: Vec<ParseEntry>,
    ) -> Result<Vec<ParseEntry>> {
        Ok(entries)
    }

    /// Optionally recover from a parser error by producing entries;
    /// `None` propagates the error.
    async fn process_spider_exception(
        &self,
        _response: &Response,
        _error: &Error,
    ) -> Option<Vec<ParseEntry>> {
        None
    }
}

/// Ordered spider-middleware chain.
pub struct SpiderMiddlewareChain {
    middlewares: Vec<Arc<dyn SpiderMiddleware>>,
}

impl SpiderMiddlewareChain {
    pub fn new(mut middlewares: Vec<Arc<dyn SpiderMiddleware>>) -> Self {
        middlewares.sort_by_key(|m| m.priority());
        Self { middlewares }
    }

    pub fn empty() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Run input hooks in priority order; the first rejection wins.
    pub async fn process_input(&self, response: &Response) -> Result<()> {
        for middleware in &self.middlewares {
            middleware.process_spider_input(response).await?;
        }
        Ok(())
    }

    /// Run output hooks in reverse priority order.
    pub async fn process_output(
        &self,
        response: &Response,
        mut entries: Vec<ParseEntry>,
    ) -> Result<Vec<ParseEntry>> {
        for middleware in self.middlewares.iter().rev() {
            entries = middleware.process_spider_output(response, entries).await?;
        }
        Ok(entries)
    }

    /// Offer a parser error to each middleware; the first recovery wins.
    pub async fn process_exception(
        &self,
        response: &Response,
        error: &Error,
    ) -> Option<Vec<ParseEntry>> {
        for middleware in self.middlewares.iter().rev() {
            if let Some(entries) = middleware.process_spider_exception(response, error).await {
                return Some(entries);
            }
        }
        None
    }
}

/// Tracks request depth and enforces DEPTH_LIMIT.
///
/// Child requests inherit `depth = parent.depth + 1`; children beyond the
/// limit are dropped with a stats counter. A non-zero `depth_priority`
/// biases deeper requests down (positive values approximate breadth-first
/// order).
pub struct DepthMiddleware {
    max_depth: u32,
    depth_priority: i64,
    stats: Arc<StatsCollector>,
}

impl DepthMiddleware {
    pub fn new(max_depth: u32, depth_priority: i64, stats: Arc<StatsCollector>) -> Self {
        Self {
            max_depth,
            depth_priority,
            stats,
        }
    }
}

#[async_trait]
impl SpiderMiddleware for DepthMiddleware {
    fn name(&self) -> &str {
        "depth"
    }

    fn priority(&self) -> i32 {
        900
    }

    async fn process_spider_output(
        &self,
        response: &Response,
        entries: Vec<ParseEntry>,
    ) -> Result<Vec<ParseEntry>> {
        let parent_depth = response.request.meta.depth;
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                ParseEntry::Request(mut request) => {
                    let depth = parent_depth + 1;
                    request.meta.depth = depth;
                    if self.depth_priority != 0 {
                        request.priority -= depth as i64 * self.depth_priority;
                    }
                    if self.max_depth > 0 && depth > self.max_depth {
                        debug!(
                            "Ignoring link (depth > {}): {}",
                            self.max_depth, request.url
                        );
                        self.stats.inc(keys::DEPTH_MAX_REACHED);
                        continue;
                    }
                    self.stats.max_value("request_depth/max", depth as i64);
                    kept.push(ParseEntry::Request(request));
                }
                item => kept.push(item),
            }
        }
        Ok(kept)
    }
}

/// Rejects responses whose status the spider does not want to parse.
///
/// 2xx always passes; anything else must be in the allow list. Rejected
/// responses go to the request's errback.
pub struct HttpErrorMiddleware {
    allowed_status: Vec<u16>,
}

impl HttpErrorMiddleware {
    pub fn new(allowed_status: Vec<u16>) -> Self {
        Self { allowed_status }
    }
}

#[async_trait]
impl SpiderMiddleware for HttpErrorMiddleware {
    fn name(&self) -> &str {
        "httperror"
    }

    fn priority(&self) -> i32 {
        50
    }

    async fn process_spider_input(&self, response: &Response) -> Result<()> {
        if response.is_success() || self.allowed_status.contains(&response.status) {
            return Ok(());
        }
        Err(Error::Http {
            status: response.status,
            url: response.url.to_string(),
        })
    }
}
