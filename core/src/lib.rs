//! Core types for the trawler crawling engine: the request/response/item
//! data model, the error taxonomy, the signal dispatcher, and the spider
//! trait that user crawlers implement.

pub mod error;
pub mod headers;
pub mod item;
pub mod request;
pub mod response;
pub mod settings;
pub mod signal;
pub mod spider;
pub mod stats;

pub use error::{Error, Result};
pub use headers::Headers;
pub use item::{Item, RoutingHints};
pub use request::{canonical_url, Method, Request, RequestMeta};
pub use response::Response;
pub use settings::Settings;
pub use signal::{Signal, SignalArgs, SignalManager};
pub use spider::{empty_stream, BasicSpider, ParseEntry, ParseOutput, ParseStream, Spider};
pub use stats::StatsCollector;

/// Re-export commonly used crates
pub use async_trait::async_trait;
pub use futures;
pub use serde;
pub use serde_json;
pub use url;
