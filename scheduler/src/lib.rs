//! Request scheduling for the trawler engine: a priority queue with
//! pluggable backends, a dupe filter in front of it, and the [`Scheduler`]
//! that bridges the two for the engine.

use std::sync::Arc;

use log::debug;

use trawler_core::error::Result;
use trawler_core::request::Request;
use trawler_core::stats::{keys, StatsCollector};

pub mod dupefilter;
pub mod queue;
pub mod serializer;

pub use dupefilter::{build_filter, DupeFilter, FilterConfig, ReleaseReason};
pub use queue::{build_queue, QueueConfig, RequestQueue};
pub use serializer::{JsonSerializer, RequestSerializer};

/// The only component the engine talks to for queue operations.
///
/// `enqueue` consults the dupe filter (unless the request opts out) before
/// pushing; `next` pops the highest-priority pending request without
/// blocking, so the engine can tell "empty now" from "waiting".
pub struct Scheduler {
    queue: Arc<dyn RequestQueue>,
    filter: Option<Arc<dyn DupeFilter>>,
    stats: Arc<StatsCollector>,
    /// Keep the pending set across runs; when false, close() clears it.
    persist: bool,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        filter: Option<Arc<dyn DupeFilter>>,
        stats: Arc<StatsCollector>,
        persist: bool,
    ) -> Self {
        Self {
            queue,
            filter,
            stats,
            persist,
        }
    }

    /// Apply the startup policy. With `flush_on_start` the pending set and
    /// the filter state from previous runs are discarded.
    pub async fn open(&self, flush_on_start: bool) -> Result<()> {
        if flush_on_start {
            self.queue.clear().await?;
            if let Some(filter) = &self.filter {
                filter.clear().await?;
            }
            return Ok(());
        }
        let pending = self.queue.len().await?;
        if pending > 0 {
            log::info!("Resuming crawl ({} requests scheduled)", pending);
        }
        Ok(())
    }

    /// Admit a request. Returns false when the dupe filter rejected it;
    /// the engine then fires `request_dropped` and forgets the request.
    pub async fn enqueue(&self, request: Request) -> Result<bool> {
        if !request.dont_filter {
            if let Some(filter) = &self.filter {
                if filter.seen(&request).await? {
                    debug!("Filtered duplicate request: {}", request.url);
                    self.stats.inc(keys::DUPEFILTER_FILTERED);
                    return Ok(false);
                }
            }
        }
        self.queue.push(request).await?;
        self.stats.inc(keys::SCHEDULER_ENQUEUED);
        Ok(true)
    }

    /// Highest-priority pending request, or `None` when the queue is empty
    /// at this instant.
    pub async fn next(&self) -> Result<Option<Request>> {
        let popped = self.queue.pop().await?;
        if popped.is_some() {
            self.stats.inc(keys::SCHEDULER_DEQUEUED);
        }
        Ok(popped)
    }

    pub async fn has_pending(&self) -> Result<bool> {
        Ok(self.queue.len().await? > 0)
    }

    /// Report a request's terminal outcome to the filter so retryable
    /// variants can retract the fingerprint.
    pub async fn release(&self, request: &Request, reason: ReleaseReason) -> Result<()> {
        if request.dont_filter {
            return Ok(());
        }
        match &self.filter {
            Some(filter) => filter.release(request, reason).await,
            None => Ok(()),
        }
    }

    pub async fn close(&self, reason: &str) -> Result<()> {
        debug!("Closing scheduler ({})", reason);
        if !self.persist {
            self.queue.clear().await?;
        }
        self.queue.close().await?;
        if let Some(filter) = &self.filter {
            filter.close().await?;
        }
        Ok(())
    }
}
