use std::collections::BTreeMap;

use dashmap::DashMap;

/// Counter names used by the core components. Kept in one place so the
/// names stay stable across releases; operators alert on them.
pub mod keys {
    pub const REQUEST_COUNT: &str = "downloader/request_count";
    pub const RESPONSE_COUNT: &str = "downloader/response_count";
    pub const RESPONSE_RECEIVED: &str = "response_received_count";
    pub const ITEM_SCRAPED: &str = "item_scraped_count";
    pub const ITEM_DROPPED: &str = "item_dropped_count";
    pub const ITEM_ERROR: &str = "item_error_count";
    pub const DUPEFILTER_FILTERED: &str = "dupefilter/filtered";
    pub const SCHEDULER_ENQUEUED: &str = "scheduler/enqueued";
    pub const SCHEDULER_DEQUEUED: &str = "scheduler/dequeued";
    pub const RETRY_COUNT: &str = "retry/count";
    pub const RETRY_MAX_REACHED: &str = "retry/max_reached";
    pub const SPIDER_EXCEPTIONS: &str = "spider_exceptions";
    pub const DEPTH_MAX_REACHED: &str = "request_depth/max_reached";
    pub const ERROR_COUNT: &str = "error_count";
    pub const FINISH_REASON: &str = "finish_reason";
}

/// Thread-safe counter store shared by every component of a crawl.
///
/// Counters are monotonic i64 values under stable string names; `set_value`
/// stores string annotations such as the finish reason.
#[derive(Debug, Default)]
pub struct StatsCollector {
    counters: DashMap<String, i64>,
    values: DashMap<String, String>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: &str) {
        self.inc_by(key, 1);
    }

    pub fn inc_by(&self, key: &str, count: i64) {
        *self.counters.entry(key.to_string()).or_insert(0) += count;
    }

    pub fn get(&self, key: &str) -> i64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Keep the maximum of the current and given value.
    pub fn max_value(&self, key: &str, value: i64) {
        let mut entry = self.counters.entry(key.to_string()).or_insert(value);
        if *entry < value {
            *entry = value;
        }
    }

    pub fn set_value(&self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    /// Sorted snapshot of all counters, for the close-time summary log.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
