use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::error::{FailureClass, RemoteError};

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_REQUEST_BODY_SIZE: usize = 1024 * 1024;
pub const MAX_RESPONSE_BODY_SIZE: usize = 50 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 64;

/// The generic HTTP client every REST adapter is built on. The host shell
/// supplies the implementation.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

#[async_trait::async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        (**self).execute(request).await
    }
}

/// Parse and check a URL before it is handed to the transport.
pub fn validate_url(raw: &str) -> Result<Url, HttpError> {
    if raw.trim().is_empty() {
        return Err(HttpError::InvalidUrl {
            url: String::new(),
            reason: "URL cannot be empty".to_string(),
        });
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(raw),
            reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
        });
    }

    let parsed = Url::parse(raw).map_err(|e| HttpError::InvalidUrl {
        url: truncate_url(raw),
        reason: e.to_string(),
    })?;
    check_url(&parsed)?;
    Ok(parsed)
}

fn check_url(url: &Url) -> Result<(), HttpError> {
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(url.as_str()),
            reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
        });
    }
    if url.host_str().is_none() {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(url.as_str()),
            reason: "URL must have a host".to_string(),
        });
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(url.as_str()),
            reason: "credentials in URL are not allowed".to_string(),
        });
    }
    Ok(())
}

fn truncate_url(url: &str) -> String {
    match url.char_indices().nth(100) {
        Some((i, _)) => format!("{}...", &url[..i]),
        None => url.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing value under the same name
    /// (case-insensitive).
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        let name = name.into();
        let value = value.into();

        Self::validate_header_name(&name)?;
        Self::validate_header_value(&name, &value)?;

        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        if self.headers.len() >= MAX_HEADERS_COUNT {
            return Err(HttpError::InvalidHeader {
                name,
                reason: format!("more than {MAX_HEADERS_COUNT} headers"),
            });
        }
        self.headers.push((name, value));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn validate_header_name(name: &str) -> Result<(), HttpError> {
        if name.is_empty() || name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.chars().take(50).collect(),
                reason: format!("header name must be 1..={MAX_HEADER_NAME_LENGTH} bytes"),
            });
        }
        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!("invalid character '{c}' in header name"),
            });
        }
        if ["host", "content-length", "transfer-encoding"]
            .iter()
            .any(|reserved| name.eq_ignore_ascii_case(reserved))
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "this header is managed by the transport".to_string(),
            });
        }
        Ok(())
    }

    fn validate_header_value(name: &str, value: &str) -> Result<(), HttpError> {
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!("value exceeds maximum length of {MAX_HEADER_VALUE_LENGTH} bytes"),
            });
        }
        if value.chars().any(|c| matches!(c, '\r' | '\n' | '\0')) {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "value contains CR, LF or NUL".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    #[must_use]
    pub const fn has_request_body(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    method: HttpMethod,
    url: Url,
    headers: HttpHeaders,
    body: Option<Vec<u8>>,
    timeout_ms: u64,
    request_id: String,
    max_response_size: usize,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: Url) -> Result<Self, HttpError> {
        check_url(&url)?;
        Ok(Self {
            method,
            url,
            headers: HttpHeaders::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_id: uuid::Uuid::new_v4().to_string(),
            max_response_size: MAX_RESPONSE_BODY_SIZE,
        })
    }

    pub fn get(url: &str) -> Result<Self, HttpError> {
        Self::new(HttpMethod::Get, validate_url(url)?)
    }

    pub fn put(url: &str) -> Result<Self, HttpError> {
        Self::new(HttpMethod::Put, validate_url(url)?)
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, HttpError> {
        if !self.method.has_request_body() {
            return Err(HttpError::InvalidRequest {
                reason: format!("{} requests cannot have a body", self.method.as_str()),
            });
        }

        let body = serde_json::to_vec(value).map_err(|e| HttpError::InvalidRequest {
            reason: format!("failed to encode body: {e}"),
        })?;
        if body.len() > MAX_REQUEST_BODY_SIZE {
            return Err(HttpError::InvalidRequest {
                reason: format!(
                    "body of {} bytes exceeds maximum of {MAX_REQUEST_BODY_SIZE}",
                    body.len()
                ),
            });
        }

        self.headers.insert("Content-Type", "application/json")?;
        self.body = Some(body);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, HttpError> {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 || ms > MAX_TIMEOUT_MS {
            return Err(HttpError::InvalidRequest {
                reason: format!("timeout must be in 1..={MAX_TIMEOUT_MS}ms"),
            });
        }
        self.timeout_ms = ms;
        Ok(self)
    }

    #[must_use]
    pub fn with_max_response_size(mut self, max_bytes: usize) -> Self {
        self.max_response_size = max_bytes.min(MAX_RESPONSE_BODY_SIZE);
        self
    }

    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn max_response_size(&self) -> usize {
        self.max_response_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Bytes,
    request_id: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>, request_id: impl Into<String>) -> Self {
        Self {
            status,
            headers: HttpHeaders::new(),
            body: body.into(),
            request_id: request_id.into(),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HttpHeaders) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse JSON: {e}"),
            request_id: self.request_id.clone(),
        })
    }

    /// Turn a non-2xx response into a classified [`RemoteError`].
    pub fn error_for_status(self) -> Result<Self, RemoteError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RemoteError::from_http_status(self.status, Some(&self.body)))
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("connection failed to {host}: {message}")]
    Connection { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("response body too large: {size} bytes exceeds maximum of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },

    #[error("request cancelled")]
    Cancelled { request_id: String },
}

impl HttpError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection { .. })
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { request_id, .. }
            | Self::InvalidResponse { request_id, .. }
            | Self::Cancelled { request_id } => Some(request_id),
            _ => None,
        }
    }
}

impl From<HttpError> for RemoteError {
    fn from(e: HttpError) -> Self {
        let class = if e.is_retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        };
        RemoteError {
            class,
            message: e.to_string(),
            status: None,
        }
    }
}
