use std::sync::Arc;

use log::{debug, warn};

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;
use trawler_core::response::Response;
use trawler_core::stats::{keys, StatsCollector};

use crate::downloader::{
    DownloaderMiddleware, ExceptionVerdict, RequestVerdict, ResponseVerdict,
};

/// Fills in headers the request does not set itself.
pub struct DefaultHeadersMiddleware {
    headers: Vec<(String, String)>,
    priority: i32,
}

impl DefaultHeadersMiddleware {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self {
            headers,
            priority: 400,
        }
    }

    /// The header set every polite crawler sends.
    pub fn common(user_agent: &str) -> Self {
        Self::new(vec![
            ("User-Agent".into(), user_agent.into()),
            (
                "Accept".into(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
            ),
            ("Accept-Language".into(), "en".into()),
        ])
    }
}

#[async_trait]
impl DownloaderMiddleware for DefaultHeadersMiddleware {
    fn name(&self) -> &str {
        "default_headers"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process_request(&self, mut request: Request) -> Result<RequestVerdict> {
        for (name, value) in &self.headers {
            if !request.headers.contains(name) {
                request.headers.set(name, value.clone());
            }
        }
        Ok(RequestVerdict::Continue(request))
    }
}

/// Applies the global DOWNLOAD_TIMEOUT to requests without their own.
pub struct DownloadTimeoutMiddleware {
    timeout_secs: f64,
}

impl DownloadTimeoutMiddleware {
    pub fn new(timeout_secs: f64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait]
impl DownloaderMiddleware for DownloadTimeoutMiddleware {
    fn name(&self) -> &str {
        "download_timeout"
    }

    fn priority(&self) -> i32 {
        350
    }

    async fn process_request(&self, mut request: Request) -> Result<RequestVerdict> {
        if request.meta.download_timeout.is_none() {
            request.meta.download_timeout = Some(self.timeout_secs);
        }
        Ok(RequestVerdict::Continue(request))
    }
}

/// Retries transient failures up to a budget.
///
/// A response whose status is in `retry_http_codes`, or a retryable
/// transport error, re-enqueues a copy of the request with `retry_count`
/// incremented and its priority adjusted; past the budget the original
/// outcome is surfaced unchanged.
pub struct RetryMiddleware {
    retry_http_codes: Vec<u16>,
    max_retries: u32,
    priority_adjust: i64,
    stats: Arc<StatsCollector>,
}

impl RetryMiddleware {
    pub fn new(
        retry_http_codes: Vec<u16>,
        max_retries: u32,
        priority_adjust: i64,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            retry_http_codes,
            max_retries,
            priority_adjust,
            stats,
        }
    }

    /// Defaults matching common transient statuses.
    pub fn common(stats: Arc<StatsCollector>) -> Self {
        Self::new(
            vec![500, 502, 503, 504, 522, 524, 408, 429],
            2,
            -1,
            stats,
        )
    }

    /// Build the retry copy, or `None` when the budget is exhausted.
    fn build_retry(&self, request: &Request, reason: &str) -> Option<Request> {
        let retries = request.meta.retry_count + 1;
        if retries > self.max_retries {
            warn!(
                "Gave up retrying {} (failed {} times): {}",
                request.url, retries, reason
            );
            self.stats.inc(keys::RETRY_MAX_REACHED);
            return None;
        }

        debug!(
            "Retrying {} (failed {} times): {}",
            request.url, retries, reason
        );
        self.stats.inc(keys::RETRY_COUNT);

        let mut retry = request.clone();
        retry.meta.retry_count = retries;
        retry.priority += self.priority_adjust;
        // The fingerprint is already recorded; without this the filter
        // would reject the retry
        retry.dont_filter = true;
        Some(retry)
    }
}

#[async_trait]
impl DownloaderMiddleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> i32 {
        550
    }

    async fn process_response(&self, response: Response) -> Result<ResponseVerdict> {
        if !self.retry_http_codes.contains(&response.status) {
            return Ok(ResponseVerdict::Respond(response));
        }
        let reason = format!("response status {}", response.status);
        match self.build_retry(&response.request, &reason) {
            Some(retry) => Ok(ResponseVerdict::Reroute(retry)),
            None => Ok(ResponseVerdict::Respond(response)),
        }
    }

    async fn process_exception(&self, request: &Request, error: Error) -> ExceptionVerdict {
        if !error.is_retryable() {
            return ExceptionVerdict::Propagate(error);
        }
        match self.build_retry(request, &error.to_string()) {
            Some(retry) => ExceptionVerdict::Reroute(retry),
            None => ExceptionVerdict::Propagate(error),
        }
    }
}
