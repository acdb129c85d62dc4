use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::item::Item;
use crate::request::Request;
use crate::response::Response;

/// Named events emitted by the engine during a crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    EngineStarted,
    SpiderOpened,
    /// A request was accepted by the scheduler
    RequestScheduled,
    /// A request was rejected (duplicate, depth limit, ...)
    RequestDropped,
    /// A response left the downloader successfully
    ResponseDownloaded,
    /// A response was handed to the scraper
    ResponseReceived,
    ItemScraped,
    ItemDropped,
    /// A parser raised an error
    SpiderError,
    /// The engine found no pending work anywhere
    SpiderIdle,
    SpiderClosed,
    EngineStopped,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::EngineStarted => "engine_started",
            Signal::SpiderOpened => "spider_opened",
            Signal::RequestScheduled => "request_scheduled",
            Signal::RequestDropped => "request_dropped",
            Signal::ResponseDownloaded => "response_downloaded",
            Signal::ResponseReceived => "response_received",
            Signal::ItemScraped => "item_scraped",
            Signal::ItemDropped => "item_dropped",
            Signal::SpiderError => "spider_error",
            Signal::SpiderIdle => "spider_idle",
            Signal::SpiderClosed => "spider_closed",
            Signal::EngineStopped => "engine_stopped",
        };
        write!(f, "{}", name)
    }
}

/// Payload delivered to signal handlers.
#[derive(Debug, Clone)]
pub enum SignalArgs {
    None,
    Request(Box<Request>),
    Response(Box<Response>),
    Item(Box<Item>),
    Error(String),
    /// Close or drop reason
    Reason(String),
    Dropped {
        request: Box<Request>,
        reason: String,
    },
}

/// An async signal handler. Handlers run sequentially in connection order.
pub type SignalHandler =
    Box<dyn Fn(SignalArgs) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static>;

/// Named-event dispatcher.
///
/// Handler failures are logged and swallowed; a misbehaving handler never
/// aborts the engine loop.
#[derive(Default)]
pub struct SignalManager {
    handlers: Arc<RwLock<HashMap<Signal, Vec<SignalHandler>>>>,
}

impl SignalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a signal.
    pub async fn connect<F>(&self, signal: Signal, handler: F)
    where
        F: Fn(SignalArgs) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.entry(signal).or_default().push(Box::new(handler));
    }

    /// Deliver a signal to all handlers sequentially, logging failures.
    pub async fn send_catch_log(&self, signal: Signal, args: SignalArgs) {
        let handlers = self.handlers.read().await;
        let Some(registered) = handlers.get(&signal) else {
            return;
        };
        for handler in registered {
            if let Err(e) = handler(args.clone()).await {
                log::error!("Error in {} signal handler: {}", signal, e);
            }
        }
    }

    /// Number of handlers registered for a signal.
    pub async fn handler_count(&self, signal: Signal) -> usize {
        self.handlers
            .read()
            .await
            .get(&signal)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn disconnect(&self, signal: Signal) {
        self.handlers.write().await.remove(&signal);
    }

    pub async fn disconnect_all(&self) {
        self.handlers.write().await.clear();
    }
}
