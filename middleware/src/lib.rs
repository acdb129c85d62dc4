//! Middleware chains for the trawler engine.
//!
//! Downloader middleware wraps every fetch with sum-typed hooks that can
//! rewrite requests, short-circuit responses, or recover from failures;
//! spider middleware wraps parser invocation. Built-ins cover default
//! headers, download timeouts, retrying, depth tracking and HTTP-status
//! filtering.

pub mod builtins;
pub mod downloader;
pub mod spider;

pub use builtins::{DefaultHeadersMiddleware, DownloadTimeoutMiddleware, RetryMiddleware};
pub use downloader::{
    DownloaderMiddleware, DownloaderMiddlewareChain, ExceptionVerdict, FetchOutcome, PreFetch,
    RequestVerdict, ResponseVerdict,
};
pub use spider::{DepthMiddleware, HttpErrorMiddleware, SpiderMiddleware, SpiderMiddlewareChain};
