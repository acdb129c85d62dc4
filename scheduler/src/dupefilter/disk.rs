use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use trawler_core::async_trait;
use trawler_core::error::Result;
use trawler_core::request::Request;

use super::{DupeFilter, ReleaseReason};

const SEEN_FILE: &str = "requests.seen";

struct Inner {
    fingerprints: HashSet<String>,
    file: File,
}

/// Fingerprint filter persisted as a newline-delimited hex log under the
/// job directory, reloaded into a memory set on open.
///
/// Retraction (release on error) only removes from the memory set; the log
/// line stays until `close` compacts the file, which is fine because a
/// retracted request re-appends its fingerprint when re-admitted.
pub struct DiskDupeFilter {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl DiskDupeFilter {
    pub async fn open(jobdir: impl AsRef<Path>) -> Result<Self> {
        tokio::fs::create_dir_all(jobdir.as_ref()).await?;
        let path = jobdir.as_ref().join(SEEN_FILE);

        let mut fingerprints = HashSet::new();
        if tokio::fs::try_exists(&path).await? {
            let reader = BufReader::new(File::open(&path).await?);
            let mut lines = reader.lines();
            while let Some(line) = lines.next_line().await? {
                let fp = line.trim();
                if !fp.is_empty() {
                    fingerprints.insert(fp.to_string());
                }
            }
        }

        if !fingerprints.is_empty() {
            log::info!(
                "Loaded {} fingerprints from {}",
                fingerprints.len(),
                path.display()
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            inner: Mutex::new(Inner { fingerprints, file }),
        })
    }
}

#[async_trait]
impl DupeFilter for DiskDupeFilter {
    async fn seen(&self, request: &Request) -> Result<bool> {
        let fp = request.fingerprint();
        let mut inner = self.inner.lock().await;
        if !inner.fingerprints.insert(fp.clone()) {
            return Ok(true);
        }
        inner.file.write_all(fp.as_bytes()).await?;
        inner.file.write_all(b"\n").await?;
        inner.file.flush().await?;
        Ok(false)
    }

    async fn release(&self, request: &Request, reason: ReleaseReason) -> Result<()> {
        if reason.is_err() {
            let mut inner = self.inner.lock().await;
            inner.fingerprints.remove(&request.fingerprint());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.fingerprints.clear();
        inner.file = File::create(&self.path).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Compact: rewrite only the fingerprints still considered seen.
        let inner = self.inner.lock().await;
        let mut contents = String::with_capacity(inner.fingerprints.len() * 65);
        for fp in &inner.fingerprints {
            contents.push_str(fp);
            contents.push('\n');
        }
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::get("https://example.com/a").unwrap();

        {
            let filter = DiskDupeFilter::open(dir.path()).await.unwrap();
            assert!(!filter.seen(&request).await.unwrap());
        }

        let filter = DiskDupeFilter::open(dir.path()).await.unwrap();
        assert!(filter.seen(&request).await.unwrap());
    }

    #[tokio::test]
    async fn log_is_newline_delimited_hex() {
        let dir = tempfile::tempdir().unwrap();
        let filter = DiskDupeFilter::open(dir.path()).await.unwrap();
        let request = Request::get("https://example.com/a").unwrap();
        filter.seen(&request).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join(SEEN_FILE)).unwrap();
        let line = contents.lines().next().unwrap();
        assert_eq!(line.len(), 64);
        assert!(line.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn release_on_error_allows_reentry_in_session() {
        let dir = tempfile::tempdir().unwrap();
        let filter = DiskDupeFilter::open(dir.path()).await.unwrap();
        let request = Request::get("https://example.com").unwrap();

        assert!(!filter.seen(&request).await.unwrap());
        filter
            .release(&request, ReleaseReason::ParseErr)
            .await
            .unwrap();
        assert!(!filter.seen(&request).await.unwrap());
    }

    #[tokio::test]
    async fn close_compacts_released_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let kept = Request::get("https://example.com/kept").unwrap();
        let released = Request::get("https://example.com/released").unwrap();

        {
            let filter = DiskDupeFilter::open(dir.path()).await.unwrap();
            filter.seen(&kept).await.unwrap();
            filter.seen(&released).await.unwrap();
            filter
                .release(&released, ReleaseReason::RequestErr)
                .await
                .unwrap();
            filter.close().await.unwrap();
        }

        let filter = DiskDupeFilter::open(dir.path()).await.unwrap();
        assert!(filter.seen(&kept).await.unwrap());
        assert!(!filter.seen(&released).await.unwrap());
    }
}
