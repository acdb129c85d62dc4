use std::sync::Arc;

use trawler_core::settings::Settings;
use trawler_core::signal::SignalManager;
use trawler_core::stats::StatsCollector;

/// Process-scope state shared by every component of one crawl.
///
/// There is no global registry anywhere in trawler; whatever a component
/// needs it receives through this context (or through its own handles), so
/// several engines can coexist in one process as long as they do not share
/// in-process queue or filter state.
pub struct CrawlerContext {
    pub spider_name: String,
    pub settings: Arc<Settings>,
    pub signals: Arc<SignalManager>,
    pub stats: Arc<StatsCollector>,
}

impl CrawlerContext {
    pub fn new(spider_name: impl Into<String>, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            spider_name: spider_name.into(),
            settings: Arc::new(settings),
            signals: Arc::new(SignalManager::new()),
            stats: Arc::new(StatsCollector::new()),
        })
    }
}
