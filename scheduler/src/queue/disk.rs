use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;

use super::RequestQueue;
use crate::serializer::RequestSerializer;

const QUEUE_FILE: &str = "requests.queue";
const FORMAT: &str = "trawler-queue";
const VERSION: u32 = 1;

/// One line of the append-only queue log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum QueueRecord {
    /// First line of every segment; makes the file self-describing.
    Header { format: String, version: u32 },
    /// A pushed request; payload is the hex-encoded serializer output.
    Push {
        seq: u64,
        priority: i64,
        payload: String,
    },
    /// Tombstone for a popped request.
    Pop { seq: u64 },
}

struct Inner {
    heap: PriorityQueue<u64, (i64, Reverse<u64>)>,
    payloads: HashMap<u64, Vec<u8>>,
    next_seq: u64,
    file: File,
}

/// Queue persisted as an append-only log under the job directory.
///
/// Restart replays the log: pushes re-enter the heap, pop tombstones remove
/// them again. `close` compacts the log to just the surviving entries.
pub struct DiskQueue {
    path: PathBuf,
    serializer: Box<dyn RequestSerializer>,
    inner: Mutex<Inner>,
}

impl DiskQueue {
    pub async fn open(
        jobdir: impl AsRef<Path>,
        serializer: Box<dyn RequestSerializer>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(jobdir.as_ref()).await?;
        let path = jobdir.as_ref().join(QUEUE_FILE);

        let mut heap = PriorityQueue::new();
        let mut payloads: HashMap<u64, Vec<u8>> = HashMap::new();
        let mut next_seq = 0u64;

        let existed = tokio::fs::try_exists(&path).await?;
        if existed {
            let reader = BufReader::new(File::open(&path).await?);
            let mut lines = reader.lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let record: QueueRecord = serde_json::from_str(&line)?;
                match record {
                    QueueRecord::Header { format, version } => {
                        if format != FORMAT || version != VERSION {
                            return Err(Error::Queue(format!(
                                "unsupported queue segment {} v{}",
                                format, version
                            )));
                        }
                    }
                    QueueRecord::Push {
                        seq,
                        priority,
                        payload,
                    } => {
                        let bytes = hex::decode(&payload)
                            .map_err(|e| Error::Queue(format!("corrupt queue payload: {}", e)))?;
                        heap.push(seq, (priority, Reverse(seq)));
                        payloads.insert(seq, bytes);
                        next_seq = next_seq.max(seq + 1);
                    }
                    QueueRecord::Pop { seq } => {
                        heap.remove(&seq);
                        payloads.remove(&seq);
                    }
                }
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if !existed {
            append_record(
                &mut file,
                &QueueRecord::Header {
                    format: FORMAT.to_string(),
                    version: VERSION,
                },
            )
            .await?;
        }

        if !payloads.is_empty() {
            log::info!(
                "Resuming crawl: {} pending requests in {}",
                payloads.len(),
                path.display()
            );
        }

        Ok(Self {
            path,
            serializer,
            inner: Mutex::new(Inner {
                heap,
                payloads,
                next_seq,
                file,
            }),
        })
    }

    /// Rewrite the log with only the surviving entries.
    async fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path).await?;
        append_record(
            &mut tmp,
            &QueueRecord::Header {
                format: FORMAT.to_string(),
                version: VERSION,
            },
        )
        .await?;

        let mut entries: Vec<(u64, i64)> = inner
            .heap
            .iter()
            .map(|(seq, (priority, _))| (*seq, *priority))
            .collect();
        entries.sort_unstable();
        for (seq, priority) in entries {
            let payload = hex::encode(&inner.payloads[&seq]);
            append_record(
                &mut tmp,
                &QueueRecord::Push {
                    seq,
                    priority,
                    payload,
                },
            )
            .await?;
        }
        tmp.sync_all().await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        inner.file = OpenOptions::new().append(true).open(&self.path).await?;
        Ok(())
    }
}

async fn append_record(file: &mut File, record: &QueueRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl RequestQueue for DiskQueue {
    async fn push(&self, request: Request) -> Result<()> {
        let bytes = self.serializer.serialize(&request)?;
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        append_record(
            &mut inner.file,
            &QueueRecord::Push {
                seq,
                priority: request.priority,
                payload: hex::encode(&bytes),
            },
        )
        .await?;

        inner.heap.push(seq, (request.priority, Reverse(seq)));
        inner.payloads.insert(seq, bytes);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Request>> {
        let mut inner = self.inner.lock().await;
        let Some((seq, _)) = inner.heap.pop() else {
            return Ok(None);
        };
        append_record(&mut inner.file, &QueueRecord::Pop { seq }).await?;
        let bytes = inner
            .payloads
            .remove(&seq)
            .ok_or_else(|| Error::Queue(format!("queue entry {} has no payload", seq)))?;
        Ok(Some(self.serializer.deserialize(&bytes)?))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().await.heap.len())
    }

    async fn clear(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.heap.clear();
            inner.payloads.clear();
        }
        self.compact().await
    }

    async fn close(&self) -> Result<()> {
        self.compact().await
    }
}
