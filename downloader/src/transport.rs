use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use reqwest::Client;

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::headers::Headers;
use trawler_core::request::{Method, Request};
use trawler_core::response::Response;

/// Fetches one request over some wire protocol.
///
/// Transports honour the per-request overrides in `meta` (proxy, timeout)
/// and must surface cancellation and timeouts as errors, never as
/// fabricated responses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn fetch(&self, request: &Request) -> Result<Response>;

    async fn close(&self) {}
}

/// Scheme -> transport map consulted per request URL.
#[derive(Default)]
pub struct TransportRegistry {
    by_scheme: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scheme: impl Into<String>, transport: Arc<dyn Transport>) {
        self.by_scheme.insert(scheme.into(), transport);
    }

    pub fn get(&self, scheme: &str) -> Result<Arc<dyn Transport>> {
        self.by_scheme.get(scheme).cloned().ok_or_else(|| {
            Error::transport_fatal(format!("no transport registered for scheme '{}'", scheme))
        })
    }

    /// Registry with the HTTP transport serving http and https.
    pub fn http(user_agent: &str) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(user_agent)?);
        let mut registry = Self::new();
        registry.insert("http", transport.clone());
        registry.insert("https", transport);
        Ok(registry)
    }

    pub async fn close_all(&self) {
        for transport in self.by_scheme.values() {
            transport.close().await;
        }
    }
}

/// HTTP(S) transport on a pooled reqwest client.
///
/// Proxies are a client-level concern in reqwest, so a separate client is
/// built and cached per distinct proxy URL; the base client serves direct
/// requests.
pub struct HttpTransport {
    base: Client,
    user_agent: String,
    proxied: DashMap<String, Client>,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let base = Self::builder(user_agent)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base,
            user_agent: user_agent.to_string(),
            proxied: DashMap::new(),
        })
    }

    fn builder(user_agent: &str) -> reqwest::ClientBuilder {
        Client::builder().user_agent(user_agent)
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client> {
        let Some(proxy_url) = proxy else {
            return Ok(self.base.clone());
        };
        if let Some(client) = self.proxied.get(proxy_url) {
            return Ok(client.clone());
        }
        let client = Self::builder(&self.user_agent)
            .proxy(
                reqwest::Proxy::all(proxy_url)
                    .map_err(|e| Error::Proxy(format!("invalid proxy '{}': {}", proxy_url, e)))?,
            )
            .build()
            .map_err(|e| Error::Proxy(format!("failed to build proxied client: {}", e)))?;
        self.proxied.insert(proxy_url.to_string(), client.clone());
        Ok(client)
    }

    fn convert_error(error: reqwest::Error, timeout: Duration) -> Error {
        if error.is_timeout() {
            return Error::Timeout(timeout);
        }
        if error.is_connect() {
            return Error::transport(format!("connection failed: {}", error));
        }
        if error.is_builder() || error.is_request() {
            return Error::transport_fatal(error.to_string());
        }
        Error::transport(error.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let timeout = Duration::from_secs_f64(
            request.meta.download_timeout.unwrap_or(180.0),
        );
        let client = self.client_for(request.meta.proxy.as_deref())?;

        let method = match request.method {
            Method::GET => reqwest::Method::GET,
            Method::POST => reqwest::Method::POST,
            Method::PUT => reqwest::Method::PUT,
            Method::DELETE => reqwest::Method::DELETE,
            Method::HEAD => reqwest::Method::HEAD,
            Method::OPTIONS => reqwest::Method::OPTIONS,
            Method::PATCH => reqwest::Method::PATCH,
        };

        debug!("Fetching {} {}", request.method.as_str(), request.url);

        let mut builder = client
            .request(method, request.url.clone())
            .timeout(timeout);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !request.cookies.is_empty() {
            let cookie = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header("cookie", cookie);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let reply = builder
            .send()
            .await
            .map_err(|e| Self::convert_error(e, timeout))?;

        let status = reply.status().as_u16();
        let final_url = reply.url().clone();
        let ip_address = reply.remote_addr().map(|addr| addr.ip().to_string());
        let protocol = format!("{:?}", reply.version());

        let mut headers = Headers::new();
        for (name, value) in reply.headers() {
            headers.append(name.as_str(), value.to_str().unwrap_or("").to_string());
        }

        let body = reply
            .bytes()
            .await
            .map_err(|e| Self::convert_error(e, timeout))?
            .to_vec();

        let mut response =
            Response::new(request.clone(), status, headers, body).with_url(final_url);
        response.protocol = Some(protocol);
        response.ip_address = ip_address;
        Ok(response)
    }

    async fn close(&self) {
        // reqwest clients shut down their pools on drop
        self.proxied.clear();
    }
}
