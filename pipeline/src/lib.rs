//! Item pipelines for the trawler engine.
//!
//! Pipelines process every scraped item sequentially. Dropping an item is
//! an explicit verdict, not an error; errors mean the pipeline itself
//! failed and are stats-counted without aborting the crawl.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use trawler_core::async_trait;
use trawler_core::error::Result;
use trawler_core::item::Item;

/// What a pipeline stage decided about an item.
#[derive(Debug)]
pub enum PipelineVerdict {
    /// Pass the (possibly modified) item to the next stage
    Keep(Item),
    /// Stop processing this item; carries the reason
    Drop(String),
}

/// One stage of item processing.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process_item(&self, item: Item, spider_name: &str) -> Result<PipelineVerdict>;

    /// Called once before the first item.
    async fn open(&self, _spider_name: &str) -> Result<()> {
        Ok(())
    }

    /// Called once at shutdown; flush buffers here.
    async fn close(&self, _spider_name: &str) -> Result<()> {
        Ok(())
    }
}

/// Runs items through every stage in order; the first drop wins.
pub struct PipelineChain {
    pipelines: Vec<Arc<dyn Pipeline>>,
}

impl PipelineChain {
    pub fn new(pipelines: Vec<Arc<dyn Pipeline>>) -> Self {
        Self { pipelines }
    }

    pub fn empty() -> Self {
        Self {
            pipelines: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub async fn open(&self, spider_name: &str) -> Result<()> {
        for pipeline in &self.pipelines {
            pipeline.open(spider_name).await?;
        }
        Ok(())
    }

    pub async fn close(&self, spider_name: &str) -> Result<()> {
        for pipeline in &self.pipelines {
            pipeline.close(spider_name).await?;
        }
        Ok(())
    }

    /// Process one item through all stages.
    pub async fn process_item(&self, mut item: Item, spider_name: &str) -> Result<PipelineVerdict> {
        for pipeline in &self.pipelines {
            match pipeline.process_item(item, spider_name).await? {
                PipelineVerdict::Keep(kept) => item = kept,
                PipelineVerdict::Drop(reason) => {
                    debug!("Pipeline '{}' dropped item: {}", pipeline.name(), reason);
                    return Ok(PipelineVerdict::Drop(reason));
                }
            }
        }
        Ok(PipelineVerdict::Keep(item))
    }
}

/// Logs every item; useful while developing a spider.
pub struct LogPipeline {
    level: log::Level,
}

impl LogPipeline {
    pub fn new(level: log::Level) -> Self {
        Self { level }
    }

    pub fn info() -> Self {
        Self::new(log::Level::Info)
    }

    pub fn debug() -> Self {
        Self::new(log::Level::Debug)
    }
}

#[async_trait]
impl Pipeline for LogPipeline {
    fn name(&self) -> &str {
        "log"
    }

    async fn process_item(&self, item: Item, spider_name: &str) -> Result<PipelineVerdict> {
        log::log!(self.level, "Spider '{}' scraped: {:?}", spider_name, item);
        Ok(PipelineVerdict::Keep(item))
    }
}

/// Drops items missing any of the required fields.
pub struct RequiredFieldsPipeline {
    required: Vec<String>,
}

impl RequiredFieldsPipeline {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }
}

#[async_trait]
impl Pipeline for RequiredFieldsPipeline {
    fn name(&self) -> &str {
        "required_fields"
    }

    async fn process_item(&self, item: Item, _spider_name: &str) -> Result<PipelineVerdict> {
        for field in &self.required {
            if !item.has_field(field) {
                return Ok(PipelineVerdict::Drop(format!(
                    "missing required field '{}'",
                    field
                )));
            }
        }
        Ok(PipelineVerdict::Keep(item))
    }
}

/// Appends items to a file as JSON lines.
///
/// Routing hints are stripped before writing; what lands on disk is only
/// the item's own fields.
pub struct JsonLinesPipeline {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesPipeline {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Pipeline for JsonLinesPipeline {
    fn name(&self) -> &str {
        "json_lines"
    }

    async fn open(&self, _spider_name: &str) -> Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn process_item(&self, mut item: Item, _spider_name: &str) -> Result<PipelineVerdict> {
        item.strip_hints();
        let mut line = serde_json::to_vec(&item)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
        }
        Ok(PipelineVerdict::Keep(item))
    }

    async fn close(&self, _spider_name: &str) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
            info!("Feed written to {}", self.path.display());
        }
        Ok(())
    }
}
