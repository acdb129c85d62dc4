use std::collections::VecDeque;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::headers::Headers;
use trawler_core::request::Request;
use trawler_core::response::Response;

use crate::transport::Transport;

/// Scripted in-memory transport for tests.
///
/// Every fetch is recorded with its dispatch time, which lets tests assert
/// pacing and concurrency invariants without a network.
pub struct MockTransport {
    scripted: DashMap<String, VecDeque<(u16, Vec<u8>)>>,
    default_status: u16,
    dispatches: Mutex<Vec<(String, Instant)>>,
}

impl MockTransport {
    /// Responds 200 with an empty body to everything.
    pub fn new() -> Self {
        Self::always(200)
    }

    /// Responds with the given status to everything not scripted.
    pub fn always(status: u16) -> Self {
        Self {
            scripted: DashMap::new(),
            default_status: status,
            dispatches: Mutex::new(Vec::new()),
        }
    }

    /// Queue responses for a URL; consumed in order, then the default
    /// status applies.
    pub fn script(&self, url: &str, responses: Vec<(u16, &str)>) {
        self.scripted.insert(
            url.to_string(),
            responses
                .into_iter()
                .map(|(status, body)| (status, body.as_bytes().to_vec()))
                .collect(),
        );
    }

    /// Every fetch performed, in dispatch order.
    pub async fn dispatch_log(&self) -> Vec<(String, Instant)> {
        self.dispatches.lock().await.clone()
    }

    pub async fn dispatch_count(&self) -> usize {
        self.dispatches.lock().await.len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = request.url.to_string();
        self.dispatches
            .lock()
            .await
            .push((url.clone(), Instant::now()));

        let (status, body) = match self.scripted.get_mut(&url) {
            Some(mut queued) => queued
                .pop_front()
                .unwrap_or((self.default_status, Vec::new())),
            None => (self.default_status, Vec::new()),
        };
        Ok(Response::new(request.clone(), status, Headers::new(), body))
    }
}

/// Transport that fails every fetch with a retryable transport error.
pub struct FailingTransport;

#[async_trait]
impl Transport for FailingTransport {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        Err(Error::transport(format!(
            "mock transport failure for {}",
            request.url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport.script("https://example.com/x", vec![(503, "busy"), (200, "ok")]);

        let request = Request::get("https://example.com/x").unwrap();
        assert_eq!(transport.fetch(&request).await.unwrap().status, 503);
        assert_eq!(transport.fetch(&request).await.unwrap().status, 200);
        // Script exhausted, default applies
        assert_eq!(transport.fetch(&request).await.unwrap().status, 200);
        assert_eq!(transport.dispatch_count().await, 3);
    }

    #[tokio::test]
    async fn failing_transport_is_retryable() {
        let request = Request::get("https://example.com").unwrap();
        let error = FailingTransport.fetch(&request).await.unwrap_err();
        assert!(error.is_retryable());
    }
}
