use std::pin::Pin;

use futures::stream::Stream;

use crate::async_trait;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::request::Request;
use crate::response::Response;

/// A single value produced by a parser: a follow-up request or an item.
#[derive(Debug, Clone)]
pub enum ParseEntry {
    Request(Request),
    Item(Item),
}

/// The async sequence a parser returns. Entries are consumed by the scraper
/// in yielded order; a parser suspends at its own I/O boundaries, not
/// between entries.
pub type ParseStream = Pin<Box<dyn Stream<Item = Result<ParseEntry>> + Send>>;

/// Eagerly-collected parser output, convertible into a [`ParseStream`].
///
/// Most parsers extract everything from the response body in one pass; this
/// keeps them free of stream plumbing.
#[derive(Debug, Default)]
pub struct ParseOutput {
    entries: Vec<ParseEntry>,
}

impl ParseOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&mut self, request: Request) -> &mut Self {
        self.entries.push(ParseEntry::Request(request));
        self
    }

    pub fn add_item(&mut self, item: Item) -> &mut Self {
        self.entries.push(ParseEntry::Item(item));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_stream(self) -> ParseStream {
        Box::pin(futures::stream::iter(self.entries.into_iter().map(Ok)))
    }
}

/// An empty parser output.
pub fn empty_stream() -> ParseStream {
    Box::pin(futures::stream::empty())
}

/// A spider: start requests plus named parsers.
///
/// Callbacks are referenced by name on [`Request::callback`] so that
/// requests survive serialization into shared queue backends; [`Spider::dispatch`]
/// resolves the name back to a method when the request is popped.
#[async_trait]
pub trait Spider: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start_urls(&self) -> Vec<String> {
        Vec::new()
    }

    /// Requests the crawl begins with. The default builds GET requests from
    /// `start_urls`.
    fn start_requests(&self) -> Result<Vec<Request>> {
        self.start_urls().into_iter().map(Request::get).collect()
    }

    /// Default parser, invoked when a request carries no callback name.
    async fn parse(&self, response: Response) -> Result<ParseStream>;

    /// Resolve a callback name to a parser invocation.
    ///
    /// Spiders with more than one parser override this with a match on
    /// their callback names.
    async fn dispatch(&self, callback: &str, response: Response) -> Result<ParseStream> {
        match callback {
            "parse" => self.parse(response).await,
            other => Err(Error::Parse(format!(
                "spider '{}' has no callback named '{}'",
                self.name(),
                other
            ))),
        }
    }

    /// Invoked with the failed request when it terminates unsuccessfully.
    /// May produce follow-up requests or items; the default logs and
    /// produces nothing.
    async fn errback(&self, request: Request, error: &Error) -> Result<ParseStream> {
        log::debug!(
            "Spider '{}': request {} failed: {}",
            self.name(),
            request.url,
            error
        );
        Ok(empty_stream())
    }

    /// Called once after the engine has fully shut down.
    async fn closed(&self, _reason: &str) {}
}

/// A spider driven entirely by configuration: crawls `start_urls` and emits
/// one item per page with the URL and status. Used by `runspider` for
/// quick checks and by tests.
pub struct BasicSpider {
    name: String,
    start_urls: Vec<String>,
}

impl BasicSpider {
    pub fn new(name: impl Into<String>, start_urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            start_urls,
        }
    }
}

#[async_trait]
impl Spider for BasicSpider {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_urls(&self) -> Vec<String> {
        self.start_urls.clone()
    }

    async fn parse(&self, response: Response) -> Result<ParseStream> {
        let mut output = ParseOutput::new();
        let item = Item::new()
            .with("url", response.url.to_string())
            .with("status", response.status);
        output.add_item(item);
        Ok(output.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use futures::StreamExt;

    struct TwoCallbackSpider;

    #[async_trait]
    impl Spider for TwoCallbackSpider {
        fn name(&self) -> &str {
            "two_callbacks"
        }

        async fn parse(&self, response: Response) -> Result<ParseStream> {
            let mut output = ParseOutput::new();
            output.add_request(
                response
                    .follow("/detail")?
                    .with_callback("parse_detail"),
            );
            Ok(output.into_stream())
        }

        async fn dispatch(&self, callback: &str, response: Response) -> Result<ParseStream> {
            match callback {
                "parse" => self.parse(response).await,
                "parse_detail" => {
                    let mut output = ParseOutput::new();
                    output.add_item(Item::new().with("url", response.url.to_string()));
                    Ok(output.into_stream())
                }
                other => Err(Error::Parse(format!("no callback '{}'", other))),
            }
        }
    }

    fn response_for(url: &str) -> Response {
        Response::new(
            Request::get(url).unwrap(),
            200,
            Headers::new(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn basic_spider_emits_one_item_per_page() {
        let spider = BasicSpider::new("basic", vec!["https://example.com".into()]);
        let mut stream = spider
            .parse(response_for("https://example.com"))
            .await
            .unwrap();

        let entry = stream.next().await.unwrap().unwrap();
        match entry {
            ParseEntry::Item(item) => {
                assert_eq!(item.get("status").unwrap(), &serde_json::json!(200));
            }
            other => panic!("expected item, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dispatch_resolves_named_callbacks() {
        let spider = TwoCallbackSpider;
        let mut stream = spider
            .dispatch("parse_detail", response_for("https://example.com/detail"))
            .await
            .unwrap();
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            ParseEntry::Item(_)
        ));

        let err = match spider
            .dispatch("missing", response_for("https://example.com"))
            .await
        {
            Ok(_) => panic!("expected dispatch to a missing callback to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn default_errback_is_empty() {
        let spider = BasicSpider::new("basic", vec![]);
        let request = Request::get("https://example.com").unwrap();
        let mut stream = spider
            .errback(request, &Error::transport("boom"))
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn start_requests_come_from_start_urls() {
        let spider = BasicSpider::new(
            "basic",
            vec![
                "https://example.com/a".into(),
                "https://example.com/b".into(),
            ],
        );
        let requests = spider.start_requests().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url.as_str(), "https://example.com/a");
    }
}
