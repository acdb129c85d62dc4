//! # Trawler
//!
//! A distributed asynchronous web-crawling engine. The engine pulls
//! requests from a pluggable priority queue, admits them under per-domain
//! politeness constraints, runs them through a middleware chain into a
//! pluggable transport, and routes parser outputs back into the queue and
//! into item pipelines. Queues and dupe filters can live in memory, on
//! disk, or in Redis/AMQP backends shared by many workers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trawler::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> trawler::Result<()> {
//!     env_logger::init();
//!
//!     let spider = Arc::new(BasicSpider::new(
//!         "example",
//!         vec!["https://example.com".to_string()],
//!     ));
//!
//!     let report = Engine::builder(spider).build().await?.run().await?;
//!     println!("finished: {}", report.finish_reason);
//!     Ok(())
//! }
//! ```

pub mod settings;
pub mod spiders;

pub use trawler_core::error::{Error, Result};

/// Component crates re-exported under one roof.
pub use trawler_core as core;
pub use trawler_downloader as downloader;
pub use trawler_engine as engine;
pub use trawler_middleware as middleware;
pub use trawler_pipeline as pipeline;
pub use trawler_scheduler as scheduler;

pub mod prelude {
    pub use trawler_core::error::{Error, Result};
    pub use trawler_core::item::Item;
    pub use trawler_core::request::Request;
    pub use trawler_core::response::Response;
    pub use trawler_core::settings::Settings;
    pub use trawler_core::signal::{Signal, SignalArgs};
    pub use trawler_core::spider::{BasicSpider, ParseEntry, ParseOutput, ParseStream, Spider};
    pub use trawler_engine::{CrawlReport, Engine, EngineBuilder, EngineHandle};
    pub use trawler_pipeline::{Pipeline, PipelineVerdict};
}
