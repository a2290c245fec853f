//! Owned HTTP request/response values passed between steps

pub mod form;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// Body encoding derived from a Content-Type header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    UrlEncoded,
    Multipart,
    Other,
}

impl ContentKind {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(ct) = content_type else {
            return ContentKind::Other;
        };
        let ct = ct.trim().to_ascii_lowercase();
        if ct.starts_with("application/x-www-form-urlencoded") {
            ContentKind::UrlEncoded
        } else if ct.starts_with("multipart/form-data") {
            ContentKind::Multipart
        } else if ct.starts_with("application/json") || ct.contains("+json") {
            ContentKind::Json
        } else {
            ContentKind::Other
        }
    }

    pub fn is_form(&self) -> bool {
        matches!(self, ContentKind::UrlEncoded | ContentKind::Multipart)
    }
}

/// Flatten a header map into name -> value, joining repeated values
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

/// Insert a header, ignoring names or values that are not valid HTTP
pub fn set_header(headers: &mut HeaderMap, name: &str, value: &str) -> bool {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
            true
        }
        _ => false,
    }
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

/// An HTTP request as seen by one step
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("Invalid request URL: {}", url))?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        set_header(&mut self.headers, name, value);
        self
    }

    pub fn with_json_body(mut self, body: &Value) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.set_body(body.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    pub fn content_kind(&self) -> ContentKind {
        ContentKind::from_content_type(self.content_type())
    }

    /// Replace the body and recompute Content-Length
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        set_content_length(&mut self.headers, self.body.len());
    }

    /// Query parameters, last value wins for repeated keys
    pub fn query_map(&self) -> BTreeMap<String, String> {
        self.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    pub fn set_query(&mut self, params: &BTreeMap<String, String>) {
        if params.is_empty() {
            self.url.set_query(None);
            return;
        }
        self.url.query_pairs_mut().clear().extend_pairs(params.iter());
    }

    /// Cookies sent with the request
    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.header("cookie")
            .unwrap_or("")
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Encode request line, headers and body as one base64 blob
    pub fn to_wire(&self) -> String {
        let mut raw = format!("{} {} HTTP/1.1\r\n", self.method, self.url).into_bytes();
        for (name, value) in &self.headers {
            raw.extend_from_slice(name.as_str().as_bytes());
            raw.extend_from_slice(b": ");
            raw.extend_from_slice(value.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(&self.body);
        STANDARD.encode(raw)
    }

    /// Decode a request produced by [`HttpRequest::to_wire`]
    pub fn from_wire(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .context("Original request is not valid base64")?;
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .context("Original request has no header terminator")?;
        let head = std::str::from_utf8(&raw[..split]).context("Request head is not UTF-8")?;
        let body = Bytes::copy_from_slice(&raw[split + 4..]);

        let mut lines = head.split("\r\n");
        let request_line = lines.next().context("Missing request line")?;
        let mut parts = request_line.split(' ');
        let method = parts.next().context("Missing method")?;
        let target = parts.next().context("Missing request target")?;
        let method = Method::from_bytes(method.as_bytes()).context("Invalid method")?;

        let mut request = HttpRequest::new(method, target)?;
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .with_context(|| format!("Malformed header line: {}", line))?;
            let name = HeaderName::from_bytes(name.trim().as_bytes())?;
            let value = HeaderValue::from_str(value.trim())?;
            request.headers.append(name, value);
        }
        request.body = body;
        Ok(request)
    }
}

/// An HTTP response produced by a backend or by the engine
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let mut response = Self {
            status,
            headers,
            body: Bytes::new(),
        };
        response.set_body(body);
        response
    }

    pub fn json(status: StatusCode, body: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self::new(status, headers, body.to_string())
    }

    /// The `{}`/200 response substituted for ignored backend errors
    pub fn empty_json() -> Self {
        Self::json(StatusCode::OK, &Value::Object(Default::default()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_kind(&self) -> ContentKind {
        ContentKind::from_content_type(self.header(CONTENT_TYPE.as_str()))
    }

    pub fn is_json(&self) -> bool {
        self.content_kind() == ContentKind::Json
    }

    pub fn is_error(&self) -> bool {
        self.status.as_u16() >= 400
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        set_content_length(&mut self.headers, self.body.len());
    }

    /// Body decoded as JSON, or the raw text when it is not JSON
    pub fn body_value(&self) -> Value {
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).to_string()))
    }

    /// Status, headers and body as one JSON document
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "status": self.status.as_u16(),
            "headers": headers_to_map(&self.headers),
            "body": self.body_value(),
        })
    }
}
