use std::time::Duration;

use trawler_core::settings::Settings;

/// Lifecycle knobs for the engine loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Heartbeat period
    pub tick_interval: Duration,
    /// Shut down once idle persists past one further tick
    pub close_on_idle: bool,
    /// Wall-clock budget for the whole crawl; `None` is unlimited
    pub closespider_timeout: Option<Duration>,
    /// Stop after this many items; 0 is unlimited
    pub closespider_itemcount: u64,
    /// Stop after this many responses; 0 is unlimited
    pub closespider_pagecount: u64,
    /// Stop after this many errors; 0 is unlimited
    pub closespider_errorcount: u64,
    /// How long shutdown waits for in-flight work to drain
    pub graceful_timeout: Duration,
    /// Discard queue and filter state from previous runs on start
    pub flush_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(5),
            close_on_idle: false,
            closespider_timeout: None,
            closespider_itemcount: 0,
            closespider_pagecount: 0,
            closespider_errorcount: 0,
            graceful_timeout: Duration::from_secs(60),
            flush_on_start: false,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let timeout_secs = settings.get_u64("CLOSESPIDER_TIMEOUT");
        Self {
            tick_interval: Duration::from_millis(
                settings.get_u64("ENGINE_TICK_INTERVAL_MS").max(1),
            ),
            close_on_idle: settings.get_bool("CLOSE_SPIDER_ON_IDLE"),
            closespider_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            closespider_itemcount: settings.get_u64("CLOSESPIDER_ITEMCOUNT"),
            closespider_pagecount: settings.get_u64("CLOSESPIDER_PAGECOUNT"),
            closespider_errorcount: settings.get_u64("CLOSESPIDER_ERRORCOUNT"),
            graceful_timeout: Duration::from_secs_f64(
                settings.get_f64("GRACEFUL_SHUTDOWN_TIMEOUT").max(0.0),
            ),
            flush_on_start: settings.get_bool("SCHEDULER_FLUSH_ON_START"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_keep_the_engine_running_on_idle() {
        let config = EngineConfig::default();
        assert!(!config.close_on_idle);
        assert_eq!(config.tick_interval, Duration::from_millis(5));
        assert!(config.closespider_timeout.is_none());
    }

    #[test]
    fn from_settings_maps_quota_keys() {
        let mut settings = Settings::defaults();
        settings.set("CLOSESPIDER_ITEMCOUNT", json!(5));
        settings.set("CLOSESPIDER_TIMEOUT", json!(30));
        settings.set("CLOSE_SPIDER_ON_IDLE", json!(true));

        let config = EngineConfig::from_settings(&settings);
        assert_eq!(config.closespider_itemcount, 5);
        assert_eq!(config.closespider_timeout, Some(Duration::from_secs(30)));
        assert!(config.close_on_idle);
        assert_eq!(config.graceful_timeout, Duration::from_secs(60));
    }
}
