use std::collections::BTreeMap;

use serde::Deserialize;

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::item::Item;
use trawler_core::request::Request;
use trawler_core::response::Response;
use trawler_core::settings::Settings;
use trawler_core::spider::{ParseOutput, ParseStream, Spider};

/// A spider defined entirely by configuration.
///
/// Library users implement [`Spider`] in code; the CLI instead builds
/// these from the `[SPIDERS.<name>]` table of the project file or from a
/// standalone spider file. The parser emits one item per page with the
/// URL, status and body size.
#[derive(Debug, Clone, Deserialize)]
pub struct SpiderDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start_urls: Vec<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

pub struct ConfigSpider {
    definition: SpiderDefinition,
    /// `-a KEY=VALUE` arguments from the command line
    args: BTreeMap<String, String>,
}

impl ConfigSpider {
    pub fn new(definition: SpiderDefinition, args: BTreeMap<String, String>) -> Self {
        Self { definition, args }
    }

    /// Start URLs from the definition plus any passed with
    /// `-a start_urls=url1,url2`.
    fn effective_start_urls(&self) -> Vec<String> {
        let mut urls = self.definition.start_urls.clone();
        if let Some(extra) = self.args.get("start_urls") {
            urls.extend(extra.split(',').map(|u| u.trim().to_string()));
        }
        urls
    }

    fn domain_allowed(&self, request: &Request) -> bool {
        if self.definition.allowed_domains.is_empty() {
            return true;
        }
        let Some(host) = request.url.host_str() else {
            return false;
        };
        self.definition
            .allowed_domains
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)))
    }
}

#[async_trait]
impl Spider for ConfigSpider {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn start_urls(&self) -> Vec<String> {
        self.effective_start_urls()
    }

    fn start_requests(&self) -> Result<Vec<Request>> {
        let requests = self
            .effective_start_urls()
            .into_iter()
            .map(Request::get)
            .collect::<Result<Vec<_>>>()?;
        Ok(requests
            .into_iter()
            .filter(|request| self.domain_allowed(request))
            .collect())
    }

    async fn parse(&self, response: Response) -> Result<ParseStream> {
        let mut output = ParseOutput::new();
        output.add_item(
            Item::new()
                .with("url", response.url.to_string())
                .with("status", response.status)
                .with("size", response.body.len()),
        );
        Ok(output.into_stream())
    }
}

/// Spiders defined in the project settings under `[SPIDERS.<name>]`.
pub fn spiders_in_settings(settings: &Settings) -> Vec<String> {
    match settings.get("SPIDERS") {
        Some(serde_json::Value::Object(table)) => table.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Build the named spider from the project settings.
pub fn spider_from_settings(
    settings: &Settings,
    name: &str,
    args: BTreeMap<String, String>,
) -> Result<ConfigSpider> {
    let table = settings
        .get("SPIDERS")
        .and_then(|spiders| spiders.get(name))
        .ok_or_else(|| Error::Config(format!("unknown spider '{}'", name)))?;

    let mut definition: SpiderDefinition = serde_json::from_value(table.clone())?;
    definition.name = name.to_string();
    Ok(ConfigSpider::new(definition, args))
}

/// Build a spider from a standalone definition file (for `runspider`).
pub fn spider_from_file(
    path: &std::path::Path,
    args: BTreeMap<String, String>,
) -> Result<ConfigSpider> {
    let contents = std::fs::read_to_string(path)?;
    let mut definition: SpiderDefinition = toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    if definition.name.is_empty() {
        definition.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "spider".to_string());
    }
    if definition.start_urls.is_empty() && !args.contains_key("start_urls") {
        return Err(Error::Config(format!(
            "{}: spider has no start_urls",
            path.display()
        )));
    }
    Ok(ConfigSpider::new(definition, args))
}
