use std::cmp::Reverse;
use std::collections::HashMap;

use priority_queue::PriorityQueue;
use tokio::sync::Mutex;

use trawler_core::async_trait;
use trawler_core::error::Result;
use trawler_core::request::Request;

use super::RequestQueue;

/// Heap entries are ordered by (priority, Reverse(seq)): higher priority
/// first, and among equal priorities the earlier push wins.
type HeapPriority = (i64, Reverse<u64>);

#[derive(Default)]
struct Inner {
    heap: PriorityQueue<u64, HeapPriority>,
    requests: HashMap<u64, Request>,
    next_seq: u64,
}

/// Single-process priority queue.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestQueue for MemoryQueue {
    async fn push(&self, request: Request) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(seq, (request.priority, Reverse(seq)));
        inner.requests.insert(seq, request);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Request>> {
        let mut inner = self.inner.lock().await;
        let Some((seq, _)) = inner.heap.pop() else {
            return Ok(None);
        };
        Ok(inner.requests.remove(&seq))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().await.heap.len())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.heap.clear();
        inner.requests.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
