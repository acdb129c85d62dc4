use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the trawler engine core.
///
/// The variants map directly onto how a failure is handled: transient
/// transport failures are retried up to the configured budget, proxy
/// failures additionally invalidate the proxy, backend failures are fatal
/// for the affected request, and configuration errors abort the crawl.
#[derive(Error, Debug)]
pub enum Error {
    /// The request URL could not be parsed
    #[error("invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Connection-level failure (DNS, refused, reset, TLS)
    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// Whether the retry middleware may re-enqueue the request
        retryable: bool,
    },

    /// The transport did not produce a response within the effective timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A response carried an HTTP error status the spider does not handle
    #[error("HTTP status {status} for {url}")]
    Http { status: u16, url: String },

    /// Proxy could not be obtained or the proxied connection failed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Dupe filter backend failure; never interpreted as seen or unseen
    #[error("dupe filter error: {0}")]
    Filter(String),

    /// Request queue backend failure
    #[error("queue error: {0}")]
    Queue(String),

    /// A parser (callback or errback) failed
    #[error("parser error: {0}")]
    Parse(String),

    /// An item pipeline rejected an item with an error (not a drop)
    #[error("item error: {0}")]
    Item(String),

    /// Invalid settings or component wiring
    #[error("configuration error: {0}")]
    Config(String),

    /// Engine-fatal condition
    #[error("engine error: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a retryable transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a permanent transport failure (e.g. malformed request).
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the retry middleware is allowed to re-enqueue the request
    /// that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout(_) => true,
            Self::Proxy(_) => true,
            // Status-based retries are decided per response by the retry
            // middleware against RETRY_HTTP_CODES, not here
            Self::Http { .. } => false,
            _ => false,
        }
    }
}

/// Result type used across the trawler crates.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(Error::transport("connection reset").is_retryable());
        assert!(Error::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(Error::Proxy("dead proxy".into()).is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!Error::transport_fatal("unsupported scheme").is_retryable());
        assert!(!Error::Parse("bad selector".into()).is_retryable());
        assert!(!Error::Filter("backend down".into()).is_retryable());
        assert!(!Error::Http {
            status: 500,
            url: "https://example.com/".into(),
        }
        .is_retryable());
    }
}
