//! End-to-end crawls against a scripted transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use trawler_core::async_trait;
use trawler_core::error::Result;
use trawler_core::item::Item;
use trawler_core::request::Request;
use trawler_core::response::Response;
use trawler_core::settings::Settings;
use trawler_core::signal::{Signal, SignalArgs};
use trawler_core::spider::{ParseOutput, ParseStream, Spider};
use trawler_core::stats::keys;
use trawler_downloader::mock::MockTransport;
use trawler_downloader::{ProxyManager, StaticProxyPool, TransportRegistry, POOL_EXHAUSTED};
use trawler_engine::Engine;

/// Emits one item per page and follows a `next` pointer `pages - 1` times.
struct ChainSpider {
    pages: u32,
}

#[async_trait]
impl Spider for ChainSpider {
    fn name(&self) -> &str {
        "chain"
    }

    fn start_urls(&self) -> Vec<String> {
        vec!["http://spider.test/page/1".into()]
    }

    async fn parse(&self, response: Response) -> Result<ParseStream> {
        let mut output = ParseOutput::new();
        output.add_item(Item::new().with("url", response.url.to_string()));

        let page: u32 = response
            .url
            .path_segments()
            .and_then(|mut segments| segments.nth(1))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if page < self.pages {
            output.add_request(response.follow(format!("/page/{}", page + 1))?);
        }
        Ok(output.into_stream())
    }
}

fn test_settings() -> Settings {
    let mut settings = Settings::defaults();
    settings.set("ENGINE_TICK_INTERVAL_MS", serde_json::json!(1));
    settings.set("CLOSE_SPIDER_ON_IDLE", serde_json::json!(true));
    settings.set("RANDOMIZE_DOWNLOAD_DELAY", serde_json::json!(false));
    settings
}

fn registry_for(transport: Arc<MockTransport>) -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    registry.insert("http", transport);
    registry
}

#[tokio::test]
async fn single_page_crawl() {
    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(ChainSpider { pages: 1 }))
        .settings(test_settings())
        .transports(registry_for(transport.clone()))
        .build()
        .await
        .unwrap();

    let report = engine.run().await.unwrap();

    assert_eq!(report.finish_reason, "finished");
    assert_eq!(report.stats.get(keys::RESPONSE_RECEIVED), Some(&1));
    assert_eq!(report.stats.get(keys::ITEM_SCRAPED), Some(&1));
    assert_eq!(transport.dispatch_count().await, 1);
}

#[tokio::test]
async fn chained_crawl_visits_every_page() {
    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(ChainSpider { pages: 10 }))
        .settings(test_settings())
        .transports(registry_for(transport.clone()))
        .build()
        .await
        .unwrap();

    let report = engine.run().await.unwrap();

    assert_eq!(report.stats.get(keys::RESPONSE_RECEIVED), Some(&10));
    assert_eq!(report.stats.get(keys::ITEM_SCRAPED), Some(&10));
}

#[tokio::test]
async fn duplicate_start_urls_are_suppressed() {
    struct TwiceSpider;

    #[async_trait]
    impl Spider for TwiceSpider {
        fn name(&self) -> &str {
            "twice"
        }

        fn start_urls(&self) -> Vec<String> {
            vec![
                "http://spider.test/same".into(),
                "http://spider.test/same".into(),
            ]
        }

        async fn parse(&self, _response: Response) -> Result<ParseStream> {
            Ok(ParseOutput::new().into_stream())
        }
    }

    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(TwiceSpider))
        .settings(test_settings())
        .transports(registry_for(transport.clone()))
        .build()
        .await
        .unwrap();

    let dropped = Arc::new(AtomicUsize::new(0));
    let dropped_clone = dropped.clone();
    engine
        .context()
        .signals
        .connect(Signal::RequestDropped, move |args| {
            let dropped = dropped_clone.clone();
            async move {
                if let SignalArgs::Dropped { reason, .. } = args {
                    assert_eq!(reason, "duplicate");
                }
                dropped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
        .await;

    let report = engine.run().await.unwrap();

    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert_eq!(report.stats.get(keys::DUPEFILTER_FILTERED), Some(&1));
    assert_eq!(transport.dispatch_count().await, 1);
}

#[tokio::test]
async fn retry_budget_gives_three_dispatches() {
    let transport = Arc::new(MockTransport::always(503));
    let engine = Engine::builder(Arc::new(ChainSpider { pages: 1 }))
        .settings(test_settings())
        .transports(registry_for(transport.clone()))
        .build()
        .await
        .unwrap();

    let report = engine.run().await.unwrap();

    // Original dispatch plus RETRY_TIMES = 2 retries
    assert_eq!(transport.dispatch_count().await, 3);
    assert_eq!(report.stats.get(keys::RETRY_COUNT), Some(&2));
    assert_eq!(report.stats.get(keys::RETRY_MAX_REACHED), Some(&1));
    // The exhausted 503 surfaces once as a received response
    assert_eq!(report.stats.get(keys::RESPONSE_RECEIVED), Some(&1));
    assert_eq!(report.stats.get(keys::ITEM_SCRAPED), None);
}

#[tokio::test]
async fn per_domain_pacing_spaces_dispatches() {
    struct TwoPageSpider;

    #[async_trait]
    impl Spider for TwoPageSpider {
        fn name(&self) -> &str {
            "two_pages"
        }

        fn start_urls(&self) -> Vec<String> {
            vec![
                "http://spider.test/a".into(),
                "http://spider.test/b".into(),
            ]
        }

        async fn parse(&self, _response: Response) -> Result<ParseStream> {
            Ok(ParseOutput::new().into_stream())
        }
    }

    let mut settings = test_settings();
    settings.set("DOWNLOAD_DELAY", serde_json::json!(0.1));
    settings.set("CONCURRENT_REQUESTS_PER_DOMAIN", serde_json::json!(1));

    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(TwoPageSpider))
        .settings(settings)
        .transports(registry_for(transport.clone()))
        .build()
        .await
        .unwrap();

    engine.run().await.unwrap();

    let log = transport.dispatch_log().await;
    assert_eq!(log.len(), 2);
    let gap = log[1].1.duration_since(log[0].1);
    assert!(gap >= Duration::from_millis(100), "gap was {:?}", gap);
}

#[tokio::test]
async fn priorities_order_dispatches() {
    struct PrioritySpider;

    #[async_trait]
    impl Spider for PrioritySpider {
        fn name(&self) -> &str {
            "priorities"
        }

        fn start_requests(&self) -> Result<Vec<Request>> {
            Ok(vec![
                Request::get("http://spider.test/zero")?,
                Request::get("http://spider.test/high")?.with_priority(10),
                Request::get("http://spider.test/low")?.with_priority(-5),
            ])
        }

        async fn parse(&self, _response: Response) -> Result<ParseStream> {
            Ok(ParseOutput::new().into_stream())
        }
    }

    let mut settings = test_settings();
    settings.set("CONCURRENT_REQUESTS", serde_json::json!(1));

    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(PrioritySpider))
        .settings(settings)
        .transports(registry_for(transport.clone()))
        .build()
        .await
        .unwrap();

    engine.run().await.unwrap();

    let order: Vec<String> = transport
        .dispatch_log()
        .await
        .into_iter()
        .map(|(url, _)| url)
        .collect();
    assert_eq!(
        order,
        vec![
            "http://spider.test/high",
            "http://spider.test/zero",
            "http://spider.test/low",
        ]
    );
}

#[tokio::test]
async fn item_quota_closes_the_spider() {
    let mut settings = test_settings();
    settings.set("CLOSESPIDER_ITEMCOUNT", serde_json::json!(5));

    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(ChainSpider { pages: 100 }))
        .settings(settings)
        .transports(registry_for(transport.clone()))
        .build()
        .await
        .unwrap();

    let report = engine.run().await.unwrap();

    assert_eq!(report.finish_reason, "closespider_itemcount");
    let items = *report.stats.get(keys::ITEM_SCRAPED).unwrap();
    // At least the quota, at most quota + in-flight concurrency - 1
    assert!((5..5 + 16).contains(&items), "item count was {}", items);
}

#[tokio::test]
async fn exhausted_proxy_pool_stops_the_crawl() {
    let mut settings = test_settings();
    // Idle close stays off so only the pool exhaustion can end the crawl
    settings.set("CLOSE_SPIDER_ON_IDLE", serde_json::json!(false));

    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(ChainSpider { pages: 1 }))
        .settings(settings)
        .transports(registry_for(transport.clone()))
        .proxy(ProxyManager::new(
            Box::new(StaticProxyPool::new(Vec::new())),
            vec![404],
        ))
        .build()
        .await
        .unwrap();

    let report = engine.run().await.unwrap();

    assert_eq!(report.finish_reason, POOL_EXHAUSTED);
    // Nothing ever reached the transport
    assert_eq!(transport.dispatch_count().await, 0);
}

#[tokio::test]
async fn operator_stop_closes_gracefully() {
    let mut settings = test_settings();
    // Idle never closes this crawl; only the operator does
    settings.set("CLOSE_SPIDER_ON_IDLE", serde_json::json!(false));

    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(ChainSpider { pages: 1 }))
        .settings(settings)
        .transports(registry_for(transport))
        .build()
        .await
        .unwrap();

    let handle = engine.handle();
    let crawl = tokio::spawn(engine.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.stop("shutdown");

    let report = crawl.await.unwrap().unwrap();
    assert_eq!(report.finish_reason, "shutdown");
    assert_eq!(report.stats.get(keys::ITEM_SCRAPED), Some(&1));
}

#[tokio::test]
async fn idle_signal_fires_before_close() {
    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(ChainSpider { pages: 1 }))
        .settings(test_settings())
        .transports(registry_for(transport))
        .build()
        .await
        .unwrap();

    let idles = Arc::new(AtomicUsize::new(0));
    let idles_clone = idles.clone();
    engine
        .context()
        .signals
        .connect(Signal::SpiderIdle, move |_| {
            let idles = idles_clone.clone();
            async move {
                idles.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
        .await;

    let report = engine.run().await.unwrap();
    assert!(idles.load(Ordering::SeqCst) >= 1);
    assert_eq!(report.finish_reason, "finished");
}

#[tokio::test]
async fn terminal_signals_follow_request_lifecycle_order() {
    let transport = Arc::new(MockTransport::new());
    let engine = Engine::builder(Arc::new(ChainSpider { pages: 1 }))
        .settings(test_settings())
        .transports(registry_for(transport))
        .build()
        .await
        .unwrap();

    let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    for signal in [
        Signal::RequestScheduled,
        Signal::ResponseReceived,
        Signal::ItemScraped,
    ] {
        let events = events.clone();
        engine
            .context()
            .signals
            .connect(signal, move |_| {
                let events = events.clone();
                async move {
                    events.lock().await.push(signal);
                    Ok(())
                }
                .boxed()
            })
            .await;
    }

    engine.run().await.unwrap();

    let seen = events.lock().await.clone();
    assert_eq!(
        seen,
        vec![
            Signal::RequestScheduled,
            Signal::ResponseReceived,
            Signal::ItemScraped,
        ]
    );
}
