//! # quarry-curl: HTTP test client for cluster nodes
//!
//! A tiny blocking HTTP/1.1 client for poking a node's REST endpoint from
//! tests:
//!
//! ```ignore
//! let response = Curl::post(runner.node()?, "/logs/doc")
//!     .body(r#"{"msg":"hello"}"#)
//!     .execute()?;
//! assert_eq!(response.content_as_map()?["created"], true);
//! ```
//!
//! Requests go through a [`ureq`] agent with one connection per request.
//! Error statuses such as `404` come back as ordinary responses.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use ureq::AgentBuilder;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result type for curl operations.
pub type CurlResult<T> = Result<T, CurlError>;

/// Errors that can occur while sending a request or reading its response.
#[derive(Debug, Error)]
pub enum CurlError {
    /// The target exposes no HTTP endpoint.
    #[error("no http endpoint: {0}")]
    NoHttpEndpoint(String),

    /// I/O error while reading the body.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Connecting, sending or receiving failed.
    #[error("http error: {0}")]
    Http(#[source] Box<ureq::Error>),

    /// The body does not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Body is not the expected JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Anything that can be addressed over HTTP.
pub trait HttpEndpoint {
    /// Address of the HTTP listener, or why there is none.
    fn http_endpoint(&self) -> CurlResult<SocketAddr>;
}

impl HttpEndpoint for SocketAddr {
    fn http_endpoint(&self) -> CurlResult<SocketAddr> {
        Ok(*self)
    }
}

impl<T: HttpEndpoint + ?Sized> HttpEndpoint for &T {
    fn http_endpoint(&self) -> CurlResult<SocketAddr> {
        (**self).http_endpoint()
    }
}

impl<T: HttpEndpoint + ?Sized> HttpEndpoint for Arc<T> {
    fn http_endpoint(&self) -> CurlResult<SocketAddr> {
        (**self).http_endpoint()
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry points for building requests.
pub struct Curl;

impl Curl {
    pub fn get(node: impl HttpEndpoint, path: &str) -> CurlRequest {
        Self::new(Method::Get, node, path)
    }

    pub fn post(node: impl HttpEndpoint, path: &str) -> CurlRequest {
        Self::new(Method::Post, node, path)
    }

    pub fn put(node: impl HttpEndpoint, path: &str) -> CurlRequest {
        Self::new(Method::Put, node, path)
    }

    pub fn delete(node: impl HttpEndpoint, path: &str) -> CurlRequest {
        Self::new(Method::Delete, node, path)
    }

    pub fn head(node: impl HttpEndpoint, path: &str) -> CurlRequest {
        Self::new(Method::Head, node, path)
    }

    /// A request for `path` on `node`. Resolution errors surface on
    /// [`CurlRequest::execute`].
    pub fn new(method: Method, node: impl HttpEndpoint, path: &str) -> CurlRequest {
        CurlRequest {
            method,
            target: node.http_endpoint(),
            path: if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            },
            params: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A request under construction.
#[derive(Debug)]
pub struct CurlRequest {
    method: Method,
    target: CurlResult<SocketAddr>,
    path: String,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<String>,
    timeout: Duration,
}

impl CurlRequest {
    /// Adds a query parameter; it is URL-encoded on the wire.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Connect, read and write timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends the request and reads the whole response. Error statuses are
    /// returned as responses; only transport failures are errors.
    pub fn execute(self) -> CurlResult<CurlResponse> {
        let addr = self.target?;
        let url = format!("http://{addr}{}", self.path);
        debug!(method = %self.method, %url, params = self.params.len(), "curl");

        let agent = AgentBuilder::new()
            .timeout_connect(self.timeout)
            .timeout_read(self.timeout)
            .timeout_write(self.timeout)
            .max_idle_connections(0)
            .build();
        let mut request = agent.request(self.method.as_str(), &url);
        for (key, value) in &self.params {
            request = request.query(key, value);
        }
        if self.body.is_some()
            && !self
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        {
            request = request.set("Content-Type", "application/json");
        }
        for (name, value) in &self.headers {
            request = request.set(name, value);
        }

        let result = match &self.body {
            Some(body) => request.send_string(body),
            None => request.call(),
        };
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(error) => return Err(CurlError::Http(Box::new(error))),
        };
        CurlResponse::read(response)
    }
}

/// A complete HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurlResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl CurlResponse {
    fn read(response: ureq::Response) -> CurlResult<Self> {
        let status = response.status();
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = response.header(&name)?.to_string();
                Some((name, value))
            })
            .collect();
        let body = response.into_string()?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// First header named `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_as_string(&self) -> &str {
        &self.body
    }

    pub fn content_as_value(&self) -> CurlResult<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Body as a JSON object.
    pub fn content_as_map(&self) -> CurlResult<Map<String, Value>> {
        match self.content_as_value()? {
            Value::Object(map) => Ok(map),
            other => Err(CurlError::InvalidResponse(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}
