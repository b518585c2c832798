//! HTTP transport to the device
//!
//! The protocol code only needs one exchange at a time, so everything above
//! this module talks to a `Transport`: send one request, get the decoded
//! response back, or a failure that tells an HTTP error status apart from a
//! device that never answered.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::tls::TrustAnchor;

pub use reqwest::Method;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The device answered with a non-2xx status
    #[error("HTTP {status}")]
    Http { status: u16, body: Value },

    /// No response at all (DNS, connect, TLS or timeout failure)
    #[error("Network failure: {0}")]
    Network(String),
}

/// One HTTP exchange
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Decoded 2xx response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// JSON when the device sent JSON, otherwise the raw text as a string
    pub body: Value,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport with a pinned trust anchor
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(trust: &TrustAnchor, timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder().use_rustls_tls().timeout(timeout);

        if let Some(ca) = trust.certificate()? {
            builder = builder.tls_built_in_root_certs(false).add_root_certificate(ca);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut req = self
            .client
            .request(request.method.clone(), &request.url)
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*");

        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        if let Some(ref body) = request.body {
            if request.method != Method::GET && request.method != Method::HEAD {
                req = req.json(body);
            }
        }

        tracing::debug!(method = %request.method, url = %request.url, "sending request");

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = resp.status();
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));

        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        if status.is_success() {
            Ok(HttpResponse {
                status: status.as_u16(),
                body,
            })
        } else {
            tracing::debug!(status = status.as_u16(), url = %request.url, "request failed");
            Err(TransportError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Join a relative path onto an API root; absolute URLs pass through.
pub fn join_url(root: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
