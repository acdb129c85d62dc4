use dashmap::DashSet;

use trawler_core::async_trait;
use trawler_core::error::Result;
use trawler_core::request::Request;

use super::{DupeFilter, ReleaseReason};

/// In-process fingerprint set. O(1) membership, gone on restart.
#[derive(Default)]
pub struct MemoryDupeFilter {
    fingerprints: DashSet<String>,
}

impl MemoryDupeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

#[async_trait]
impl DupeFilter for MemoryDupeFilter {
    async fn seen(&self, request: &Request) -> Result<bool> {
        // insert returns false when the value was already present
        Ok(!self.fingerprints.insert(request.fingerprint()))
    }

    async fn release(&self, request: &Request, reason: ReleaseReason) -> Result<()> {
        if reason.is_err() {
            self.fingerprints.remove(&request.fingerprint());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.fingerprints.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_is_unseen() {
        let filter = MemoryDupeFilter::new();
        let request = Request::get("https://example.com/a").unwrap();

        assert!(!filter.seen(&request).await.unwrap());
        assert!(filter.seen(&request).await.unwrap());
        assert_eq!(filter.len(), 1);
    }

    #[tokio::test]
    async fn equivalent_requests_share_a_fingerprint() {
        let filter = MemoryDupeFilter::new();
        let a = Request::get("https://example.com/p?x=1&y=2").unwrap();
        let b = Request::get("https://example.com/p?y=2&x=1").unwrap();

        assert!(!filter.seen(&a).await.unwrap());
        assert!(filter.seen(&b).await.unwrap());
    }

    #[tokio::test]
    async fn release_on_error_allows_reentry() {
        let filter = MemoryDupeFilter::new();
        let request = Request::get("https://example.com").unwrap();

        assert!(!filter.seen(&request).await.unwrap());
        filter
            .release(&request, ReleaseReason::RequestErr)
            .await
            .unwrap();
        assert!(!filter.seen(&request).await.unwrap());
    }

    #[tokio::test]
    async fn release_on_success_keeps_fingerprint() {
        let filter = MemoryDupeFilter::new();
        let request = Request::get("https://example.com").unwrap();

        assert!(!filter.seen(&request).await.unwrap());
        filter
            .release(&request, ReleaseReason::ParseOk)
            .await
            .unwrap();
        assert!(filter.seen(&request).await.unwrap());
    }

    #[tokio::test]
    async fn clear_resets_the_filter() {
        let filter = MemoryDupeFilter::new();
        let request = Request::get("https://example.com").unwrap();
        filter.seen(&request).await.unwrap();

        filter.clear().await.unwrap();
        assert!(!filter.seen(&request).await.unwrap());
    }
}
