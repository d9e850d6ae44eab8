//! # Transport
//!
//! The single network primitive the rest of the crate consumes: perform one request and
//! return the parsed JSON body, or a classified [`CacheError::Transport`].
//! [`HttpTransport`] implements it over `reqwest`; tests substitute their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::{CacheError, CacheResult};

/// HTTP methods used by resource clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Caller-supplied request options, forwarded unchanged by resource clients
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One request handed to a [`Transport`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: String,
    pub options: RequestOptions,
    pub body: Option<serde_json::Value>,
}

impl TransportRequest {
    pub fn new<U: Into<String>>(method: HttpMethod, url: U) -> Self {
        Self {
            method,
            url: url.into(),
            options: RequestOptions::default(),
            body: None,
        }
    }

    pub fn get<U: Into<String>>(url: U) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_body(mut self, body: Option<serde_json::Value>) -> Self {
        self.body = body;
        self
    }
}

/// Performs one network request
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> CacheResult<serde_json::Value>;
}

/// `reqwest`-backed transport. Relative URLs are resolved against `origin`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    origin: Option<Url>,
    default_timeout: Duration,
}

impl HttpTransport {
    pub fn new(origin: Option<Url>, default_timeout: Duration) -> CacheResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(default_timeout)
            .build()
            .map_err(|e| CacheError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            origin,
            default_timeout,
        })
    }

    pub fn origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }

    fn resolve_url(&self, url: &str) -> CacheResult<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let origin = self.origin.as_ref().ok_or_else(|| {
                    CacheError::config(format!(
                        "Relative URL '{}' requires an API origin to be configured",
                        url
                    ))
                })?;
                origin
                    .join(url)
                    .map_err(|e| CacheError::config(format!("Invalid URL '{}': {}", url, e)))
            }
            Err(e) => Err(CacheError::config(format!("Invalid URL '{}': {}", url, e))),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> CacheResult<serde_json::Value> {
        let url = self.resolve_url(&request.url)?;
        let TransportRequest {
            method,
            options,
            body,
            ..
        } = request;

        let mut builder = self
            .client
            .request(method.into(), url.clone())
            .timeout(options.timeout.unwrap_or(self.default_timeout));

        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        debug!(method = %method, url = %url, "Sending request");
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text
            };
            warn!(method = %method, url = %url, status = status.as_u16(), "Request failed");
            return Err(CacheError::http_status(url.as_str(), status.as_u16(), message));
        }

        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}
