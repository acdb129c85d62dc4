use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

/// Flat key -> value configuration with typed getters.
///
/// Keys are upper snake case. Values are JSON so settings files, `-s`
/// command-line overrides and environment variables all feed the same
/// store; the last write wins. Keys still carrying their built-in default
/// are tracked so callers can tell an explicit choice from a default.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: BTreeMap<String, Value>,
    defaulted: BTreeSet<String>,
}

impl Settings {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in defaults every crawl starts from.
    pub fn defaults() -> Self {
        let mut settings = Self::empty();
        let defaults: &[(&str, Value)] = &[
            // Concurrency
            ("CONCURRENT_REQUESTS", json!(16)),
            ("CONCURRENT_REQUESTS_PER_DOMAIN", json!(8)),
            ("DOWNLOAD_DELAY", json!(0.0)),
            ("RANDOMIZE_DOWNLOAD_DELAY", json!(true)),
            ("DOWNLOAD_TIMEOUT", json!(180.0)),
            ("CONCURRENT_PARSER", json!(1)),
            ("SCRAPER_SLOT_MAX_ACTIVE_SIZE", json!(5_000_000)),
            // Engine
            ("ENGINE_TICK_INTERVAL_MS", json!(5)),
            ("GRACEFUL_SHUTDOWN_TIMEOUT", json!(60.0)),
            ("CLOSE_SPIDER_ON_IDLE", json!(false)),
            ("CLOSESPIDER_TIMEOUT", json!(0)),
            ("CLOSESPIDER_ITEMCOUNT", json!(0)),
            ("CLOSESPIDER_PAGECOUNT", json!(0)),
            ("CLOSESPIDER_ERRORCOUNT", json!(0)),
            // Scheduling
            ("SCHEDULER_QUEUE_CLASS", json!("memory")),
            ("SCHEDULER_FLUSH_ON_START", json!(false)),
            ("SCHEDULER_PERSIST", json!(true)),
            ("SCHEDULER_SERIALIZER", json!("json")),
            ("DUPEFILTER_CLASS", json!("memory")),
            ("DUPEFILTER_INFLIGHT_TTL", json!(180)),
            // The exponent convention: m = 1 << BLOOMFILTER_BIT bits, so the
            // default bitmap is 2^30 bits = 128 MiB with ~1e-5 false
            // positives at 100M fingerprints
            ("BLOOMFILTER_BIT", json!(30)),
            ("BLOOMFILTER_HASH_NUMBER", json!(6)),
            // Retry
            ("RETRY_ENABLED", json!(true)),
            ("RETRY_TIMES", json!(2)),
            (
                "RETRY_HTTP_CODES",
                json!([500, 502, 503, 504, 522, 524, 408, 429]),
            ),
            ("RETRY_PRIORITY_ADJUST", json!(-1)),
            // Depth
            ("DEPTH_LIMIT", json!(0)),
            ("DEPTH_PRIORITY", json!(0)),
            // HTTP
            ("USER_AGENT", json!("trawler/0.2")),
            ("HTTPERROR_ALLOWED_CODES", json!([])),
            // Proxy
            ("USE_PROXY", json!(false)),
            ("PROXY_MAX_COUNT", json!(16)),
            ("PROXY_MIN_COUNT", json!(1)),
            ("PROXY_ALLOW_STATUS_CODE", json!([404])),
            // Logging
            ("LOG_LEVEL", json!("info")),
        ];
        for (key, value) in defaults {
            settings.values.insert((*key).to_string(), value.clone());
            settings.defaulted.insert((*key).to_string());
        }
        settings
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.defaulted.remove(&key);
        self.values.insert(key, value);
    }

    /// Set from a string, parsing JSON scalars where possible so
    /// `-s RETRY_TIMES=3` yields a number and `-s JOBDIR=./job` a string.
    pub fn set_str(&mut self, key: impl Into<String>, raw: &str) {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        self.set(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Whether the key was set by a settings file, override or environment
    /// variable rather than carrying its built-in default.
    pub fn is_explicit(&self, key: &str) -> bool {
        self.values.contains_key(key) && !self.defaulted.contains(key)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "True" | "1"),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            _ => false,
        }
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        match self.values.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.get_i64(key).max(0) as u64
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        match self.values.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_u16_list(&self, key: &str) -> Vec<u16> {
        match self.values.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_u64())
                .filter(|n| *n <= u16::MAX as u64)
                .map(|n| n as u16)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Fold another settings layer over this one. Explicit keys in the
    /// layer override; its untouched defaults only fill gaps.
    pub fn merge(&mut self, other: Settings) {
        for (key, value) in other.values {
            let explicit = !other.defaulted.contains(&key);
            if explicit {
                self.set(key, value);
            } else if !self.values.contains_key(&key) {
                self.values.insert(key.clone(), value);
                self.defaulted.insert(key);
            }
        }
    }

    /// Override any known key from an environment variable of the same
    /// name. Only keys already present are considered, so arbitrary
    /// environment noise cannot inject settings.
    pub fn apply_env_overrides(&mut self) {
        let keys: Vec<String> = self.values.keys().cloned().collect();
        for key in keys {
            if let Ok(raw) = std::env::var(&key) {
                self.set_str(key, &raw);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let settings = Settings::defaults();
        assert_eq!(settings.get_i64("CONCURRENT_REQUESTS"), 16);
        assert_eq!(settings.get_i64("CONCURRENT_REQUESTS_PER_DOMAIN"), 8);
        assert_eq!(settings.get_f64("DOWNLOAD_DELAY"), 0.0);
        assert!(settings.get_bool("RANDOMIZE_DOWNLOAD_DELAY"));
        assert_eq!(settings.get_f64("DOWNLOAD_TIMEOUT"), 180.0);
        assert_eq!(settings.get_i64("RETRY_TIMES"), 2);
        assert_eq!(settings.get_i64("RETRY_PRIORITY_ADJUST"), -1);
        assert!(!settings.get_bool("CLOSE_SPIDER_ON_IDLE"));
        assert_eq!(settings.get_i64("DEPTH_LIMIT"), 0);
        assert!(settings.get_u16_list("RETRY_HTTP_CODES").contains(&503));
        assert_eq!(settings.get_u16_list("PROXY_ALLOW_STATUS_CODE"), vec![404]);
    }

    #[test]
    fn set_str_parses_scalars() {
        let mut settings = Settings::empty();
        settings.set_str("RETRY_TIMES", "5");
        settings.set_str("RANDOMIZE_DOWNLOAD_DELAY", "false");
        settings.set_str("JOBDIR", "./job");

        assert_eq!(settings.get_i64("RETRY_TIMES"), 5);
        assert!(!settings.get_bool("RANDOMIZE_DOWNLOAD_DELAY"));
        assert_eq!(settings.get_str("JOBDIR"), Some("./job"));
    }

    #[test]
    fn merge_overwrites() {
        let mut base = Settings::defaults();
        let mut layer = Settings::empty();
        layer.set("RETRY_TIMES", json!(7));
        base.merge(layer);
        assert_eq!(base.get_i64("RETRY_TIMES"), 7);
        // Untouched defaults survive
        assert_eq!(base.get_i64("CONCURRENT_REQUESTS"), 16);
    }

    #[test]
    fn explicit_keys_are_distinguished_from_defaults() {
        let mut settings = Settings::defaults();
        assert!(!settings.is_explicit("RETRY_TIMES"));

        settings.set("RETRY_TIMES", json!(3));
        assert!(settings.is_explicit("RETRY_TIMES"));
        assert!(!settings.is_explicit("CONCURRENT_REQUESTS"));
        assert!(!settings.is_explicit("NOT_A_KEY"));
    }

    #[test]
    fn env_overrides_apply_to_known_keys_only() {
        let mut settings = Settings::defaults();
        std::env::set_var("RETRY_TIMES", "9");
        std::env::set_var("SOME_RANDOM_VAR", "1");
        settings.apply_env_overrides();
        std::env::remove_var("RETRY_TIMES");
        std::env::remove_var("SOME_RANDOM_VAR");

        assert_eq!(settings.get_i64("RETRY_TIMES"), 9);
        assert!(!settings.contains("SOME_RANDOM_VAR"));
    }
}
