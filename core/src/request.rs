use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::Result;
use crate::headers::Headers;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Method {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

/// Per-request policy carried alongside a request.
///
/// The fields the engine itself reads are typed; anything a spider wants to
/// smuggle between its own callbacks goes in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Proxy URL override; set by the proxy pool or by the spider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Per-request download timeout in seconds; capped by DOWNLOAD_TIMEOUT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_timeout: Option<f64>,

    /// How many times the retry middleware has re-enqueued this request
    #[serde(default)]
    pub retry_count: u32,

    /// Parent->child hops from the spider's start requests
    #[serde(default)]
    pub depth: u32,

    /// Download slot override; defaults to the request host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_slot: Option<String>,

    /// Whether the proxy pool should attach a proxy to this request
    #[serde(default = "default_use_proxy")]
    pub use_proxy: bool,

    /// Free-form user data, opaque to the engine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_use_proxy() -> bool {
    true
}

impl Default for RequestMeta {
    fn default() -> Self {
        Self {
            proxy: None,
            download_timeout: None,
            retry_count: 0,
            depth: 0,
            download_slot: None,
            use_proxy: default_use_proxy(),
            extra: BTreeMap::new(),
        }
    }
}

impl RequestMeta {
    /// Effective timeout for a fetch given the global ceiling, in seconds.
    pub fn effective_timeout(&self, download_timeout: f64) -> Duration {
        let secs = match self.download_timeout {
            Some(t) => t.min(download_timeout),
            None => download_timeout,
        };
        Duration::from_secs_f64(secs)
    }
}

/// A request to be fetched by the crawler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Absolute target URL
    pub url: Url,

    #[serde(default)]
    pub method: Method,

    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,

    /// Opaque request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,

    /// Per-request policy bag
    #[serde(default)]
    pub meta: RequestMeta,

    /// Higher values are served first; ties are FIFO
    #[serde(default)]
    pub priority: i64,

    /// Parser invoked with the response, resolved by name on the spider.
    /// `None` means the spider's default `parse`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,

    /// Parser invoked with (request, error) when the request fails terminally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errback: Option<String>,

    /// Bypass the dupe filter for this request
    #[serde(default)]
    pub dont_filter: bool,

    /// Free-form labels used for logging
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

impl Request {
    /// Create a GET request for the given URL.
    pub fn get(url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        Ok(Self::from_url(url, Method::GET, None))
    }

    /// Create a POST request with a body.
    pub fn post(url: impl AsRef<str>, body: impl Into<Vec<u8>>) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        Ok(Self::from_url(url, Method::POST, Some(body.into())))
    }

    fn from_url(url: Url, method: Method, body: Option<Vec<u8>>) -> Self {
        Self {
            url,
            method,
            headers: Headers::new(),
            body,
            cookies: BTreeMap::new(),
            meta: RequestMeta::default(),
            priority: 0,
            callback: None,
            errback: None,
            dont_filter: false,
            flags: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    pub fn with_errback(mut self, errback: impl Into<String>) -> Self {
        self.errback = Some(errback.into());
        self
    }

    pub fn with_dont_filter(mut self, dont_filter: bool) -> Self {
        self.dont_filter = dont_filter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.meta.download_timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.meta.proxy = Some(proxy.into());
        self
    }

    pub fn with_meta_extra(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.meta.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// The download-slot key for this request: the explicit override from
    /// meta when present, otherwise the host.
    pub fn slot_key(&self) -> String {
        if let Some(slot) = &self.meta.download_slot {
            return slot.clone();
        }
        self.url.host_str().unwrap_or("").to_string()
    }

    /// Deterministic fingerprint identifying a logically unique request.
    ///
    /// Hashes the uppercased method, the canonicalized URL, the body, and
    /// the values of any headers declared significant. Two requests with
    /// equal fingerprints are duplicates for filtering purposes.
    pub fn fingerprint(&self) -> String {
        self.fingerprint_with_headers(&[])
    }

    /// Fingerprint including the named headers in the hash input.
    pub fn fingerprint_with_headers(&self, significant_headers: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_url(&self.url).as_bytes());
        hasher.update(b"\n");
        if let Some(body) = &self.body {
            hasher.update(body);
        }
        let mut names: Vec<&str> = significant_headers.to_vec();
        names.sort_unstable();
        for name in names {
            for value in self.headers.get_all(name) {
                hasher.update(b"\n");
                hasher.update(name.to_ascii_lowercase().as_bytes());
                hasher.update(b":");
                hasher.update(value.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Canonical form of a URL for fingerprinting: lowercase scheme and host
/// (the `url` crate normalizes both on parse), canonical percent-encoding,
/// query parameters sorted, fragment dropped.
pub fn canonical_url(url: &Url) -> String {
    let mut canonical = url.clone();
    canonical.set_fragment(None);

    let mut pairs: Vec<(String, String)> = canonical
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        canonical.set_query(None);
    } else {
        pairs.sort();
        canonical
            .query_pairs_mut()
            .clear()
            .extend_pairs(pairs)
            .finish();
    }
    canonical.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_builds_default_request() {
        let req = Request::get("https://example.com").unwrap();
        assert_eq!(req.url.as_str(), "https://example.com/");
        assert_eq!(req.method, Method::GET);
        assert!(req.body.is_none());
        assert!(!req.dont_filter);
        assert_eq!(req.meta.retry_count, 0);
    }

    #[test]
    fn post_carries_body() {
        let req = Request::post("https://example.com/submit", "payload").unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.body.as_deref(), Some(b"payload".as_slice()));
    }

    #[test]
    fn slot_key_prefers_meta_override() {
        let mut req = Request::get("https://example.com/a").unwrap();
        assert_eq!(req.slot_key(), "example.com");

        req.meta.download_slot = Some("pool-7".into());
        assert_eq!(req.slot_key(), "pool-7");
    }

    #[test]
    fn fingerprint_ignores_fragment_and_query_order() {
        let a = Request::get("https://example.com/path?b=2&a=1#frag").unwrap();
        let b = Request::get("https://example.com/path?a=1&b=2").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_method_and_body() {
        let get = Request::get("https://example.com/x").unwrap();
        let post = Request::post("https://example.com/x", "data").unwrap();
        let post2 = Request::post("https://example.com/x", "other").unwrap();
        assert_ne!(get.fingerprint(), post.fingerprint());
        assert_ne!(post.fingerprint(), post2.fingerprint());
    }

    #[test]
    fn fingerprint_host_is_case_insensitive() {
        let a = Request::get("https://EXAMPLE.com/x").unwrap();
        let b = Request::get("https://example.com/x").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn significant_headers_opt_in() {
        let plain = Request::get("https://example.com/x").unwrap();
        let tokened = Request::get("https://example.com/x")
            .unwrap()
            .with_header("Authorization", "Bearer abc");

        assert_eq!(plain.fingerprint(), tokened.fingerprint());
        assert_ne!(
            plain.fingerprint_with_headers(&["authorization"]),
            tokened.fingerprint_with_headers(&["authorization"])
        );
    }

    #[test]
    fn effective_timeout_is_capped() {
        let mut meta = RequestMeta::default();
        assert_eq!(meta.effective_timeout(180.0), Duration::from_secs(180));

        meta.download_timeout = Some(10.0);
        assert_eq!(meta.effective_timeout(180.0), Duration::from_secs(10));

        meta.download_timeout = Some(600.0);
        assert_eq!(meta.effective_timeout(180.0), Duration::from_secs(180));
    }

    #[test]
    fn serializes_round_trip() {
        let req = Request::post("https://example.com/x?q=1", "body")
            .unwrap()
            .with_header("X-Test", "1")
            .with_priority(5)
            .with_callback("parse_page");

        let bytes = serde_json::to_vec(&req).unwrap();
        let restored: Request = serde_json::from_slice(&bytes).unwrap();
        let bytes2 = serde_json::to_vec(&restored).unwrap();
        assert_eq!(bytes, bytes2);
        assert_eq!(restored.priority, 5);
        assert_eq!(restored.callback.as_deref(), Some("parse_page"));
    }
}
