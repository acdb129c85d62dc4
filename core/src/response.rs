use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::request::Request;

/// An HTTP response received by the crawler.
///
/// A response is always born from exactly one request, carried in
/// `request`; `url` is the final URL after any transport-level redirects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Final URL after redirects
    pub url: Url,

    pub status: u16,

    #[serde(default)]
    pub headers: Headers,

    pub body: Vec<u8>,

    /// The request that produced this response
    pub request: Request,

    /// Free-form labels used for logging
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,

    /// Server IP address, when the transport exposes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Peer certificate (DER), when the transport exposes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Vec<u8>>,

    /// Negotiated protocol, e.g. "HTTP/1.1" or "h2"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl Response {
    pub fn new(request: Request, status: u16, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            url: request.url.clone(),
            status,
            headers,
            body,
            request,
            flags: Vec::new(),
            ip_address: None,
            certificate: None,
            protocol: None,
        }
    }

    /// Override the final URL (set by transports after redirects).
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as UTF-8.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.clone())
            .map_err(|e| Error::Parse(format!("response body is not valid UTF-8: {}", e)))
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Resolve a possibly-relative URL against this response's URL.
    pub fn urljoin(&self, url: impl AsRef<str>) -> Result<Url> {
        Ok(self.url.join(url.as_ref())?)
    }

    /// Build a follow-up GET request for a URL found in this response.
    ///
    /// The child inherits the parent's cookies and its depth plus one.
    pub fn follow(&self, url: impl AsRef<str>) -> Result<Request> {
        let absolute = self.urljoin(url)?;
        let mut request = Request::get(absolute.as_str())?;
        request.meta.depth = self.request.meta.depth + 1;
        request.cookies = self.request.cookies.clone();
        Ok(request)
    }

    /// Build follow-up requests for several URLs at once.
    pub fn follow_all<U, I>(&self, urls: I) -> Result<Vec<Request>>
    where
        U: AsRef<str>,
        I: IntoIterator<Item = U>,
    {
        urls.into_iter().map(|url| self.follow(url)).collect()
    }
}
