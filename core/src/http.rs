//! Canonical request and response values shared by both transports.
//!
//! # Design
//! These types describe HTTP traffic as plain data, independent of which host
//! primitive produced it. A `Request` is immutable once built: every rewrite
//! (`with_url`, `with_header`, ...) returns a new value and leaves the
//! original untouched, so concurrent filters always observe a consistent
//! snapshot. The parts sit behind an `Arc`, which keeps passing a request to
//! each filter cheap.
//!
//! A `Response` buffers its body but only lets each view read it once, the
//! way the async primitive does. `try_clone` hands out independent views
//! until the body has been read.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// HTTP method for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    /// Any other token, kept exactly as the caller spelled it.
    Other(String),
}

impl Method {
    /// Standard tokens are matched case-insensitively and normalized.
    pub fn parse(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            _ => Method::Other(token.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Other(token) => token,
        }
    }

    /// GET and HEAD never carry a body on the wire.
    pub fn allows_body(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Method {
    fn from(token: &str) -> Self {
        Method::parse(token)
    }
}

/// Ordered header multimap with case-insensitive names.
///
/// Insertion order is preserved, including for repeated names, so a request
/// replayed onto a transport sends its headers in the order the caller set
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value stored under `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// All values for `name` joined with `", "`, or `None` if absent.
    pub fn get(&self, name: &str) -> Option<String> {
        let values = self.get_all(name);
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns true if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Parse the CRLF-delimited `name: value` blob a stateful transport
    /// exposes. Lines without a colon are skipped.
    pub fn parse_raw(raw: &str) -> Self {
        let mut headers = Headers::new();
        for line in raw.split("\r\n").flat_map(|l| l.split('\n')) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            headers.append(name, value.trim());
        }
        headers
    }

    /// Render as a raw blob: lower-cased names, one `name: value\r\n` line per
    /// entry.
    pub fn to_raw(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            out.push_str(&name.to_ascii_lowercase());
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// Reject header names that are not RFC 7230 tokens and values carrying line
/// breaks.
pub fn validate_header(name: &str, value: &str) -> Result<(), TransportError> {
    let valid_name = !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        });
    if !valid_name {
        return Err(TransportError::InvalidHeader(name.to_string()));
    }
    if value.contains(['\r', '\n', '\0']) {
        return Err(TransportError::InvalidHeader(format!("{name}: {value:?}")));
    }
    Ok(())
}

/// True when a content-type header value announces multipart form encoding.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

/// True when a content-type header value is JSON or textual.
pub fn is_textual(content_type: &str) -> bool {
    let ct = content_type.trim_start().to_ascii_lowercase();
    ct.starts_with("text/")
        || ct.starts_with("application/json")
        || ct.contains("+json")
        || ct.starts_with("application/x-www-form-urlencoded")
}

/// One part of a structured form body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub value: FormValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File {
        filename: String,
        content_type: String,
        data: Bytes,
    },
}

/// Ordered structured form parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData {
    parts: Vec<FormPart>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parts.push(FormPart {
            name: name.into(),
            value: FormValue::Text(value.into()),
        });
    }

    pub fn append_file(
        &mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) {
        self.parts.push(FormPart {
            name: name.into(),
            value: FormValue::File {
                filename: filename.into(),
                content_type: content_type.into(),
                data: data.into(),
            },
        });
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&FormValue> {
        self.parts.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Encode as `multipart/form-data` with a freshly generated boundary.
    ///
    /// Returns the content-type header value (boundary included) and the
    /// encoded body.
    pub fn to_multipart(&self) -> (String, Bytes) {
        let boundary = format!("----netfilter{}", Uuid::new_v4().simple());
        let mut out = BytesMut::new();
        for part in &self.parts {
            out.put_slice(format!("--{boundary}\r\n").as_bytes());
            match &part.value {
                FormValue::Text(text) => {
                    out.put_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                            escape_quoted(&part.name)
                        )
                        .as_bytes(),
                    );
                    out.put_slice(text.as_bytes());
                }
                FormValue::File {
                    filename,
                    content_type,
                    data,
                } => {
                    out.put_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {content_type}\r\n\r\n",
                            escape_quoted(&part.name),
                            escape_quoted(filename)
                        )
                        .as_bytes(),
                    );
                    out.put_slice(data);
                }
            }
            out.put_slice(b"\r\n");
        }
        out.put_slice(format!("--{boundary}--\r\n").as_bytes());
        (
            format!("multipart/form-data; boundary={boundary}"),
            out.freeze(),
        )
    }
}

fn escape_quoted(s: &str) -> String {
    s.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

/// A request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    Binary(Bytes),
    Form(FormData),
}

impl Body {
    /// Raw bytes for text and binary bodies. Form bodies have no canonical
    /// byte form until a boundary is chosen, see [`FormData::to_multipart`].
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Body::Text(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
            Body::Binary(bytes) => Some(bytes.clone()),
            Body::Form(_) => None,
        }
    }

    /// The content type a transport assumes when the caller set none.
    pub fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Body::Text(_) => Some("text/plain;charset=UTF-8"),
            Body::Binary(_) => None,
            Body::Form(_) => Some("multipart/form-data"),
        }
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Binary(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Binary(Bytes::from(bytes))
    }
}

impl From<FormData> for Body {
    fn from(form: FormData) -> Self {
        Body::Form(form)
    }
}

/// Whether cookies and auth travel with a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestParts {
    method: Method,
    url: String,
    headers: Headers,
    body: Option<Body>,
    credentials: CredentialsMode,
}

/// An immutable request descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    inner: Arc<RequestParts>,
}

impl Request {
    pub fn builder(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            parts: RequestParts {
                method: Method::Get,
                url: url.into(),
                headers: Headers::new(),
                body: None,
                credentials: CredentialsMode::default(),
            },
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::builder(url).build()
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.inner.body.as_ref()
    }

    pub fn credentials(&self) -> CredentialsMode {
        self.inner.credentials
    }

    /// A builder seeded with a copy of this request.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            parts: (*self.inner).clone(),
        }
    }

    pub fn with_url(&self, url: impl Into<String>) -> Request {
        let mut parts = (*self.inner).clone();
        parts.url = url.into();
        Request::from_parts(parts)
    }

    pub fn with_method(&self, method: impl Into<Method>) -> Request {
        let mut parts = (*self.inner).clone();
        parts.method = method.into();
        Request::from_parts(parts)
    }

    /// Copy with `name` set to exactly `value`.
    pub fn with_header(&self, name: impl Into<String>, value: impl Into<String>) -> Request {
        let mut parts = (*self.inner).clone();
        parts.headers.set(name, value);
        Request::from_parts(parts)
    }

    pub fn without_header(&self, name: &str) -> Request {
        let mut parts = (*self.inner).clone();
        parts.headers.remove(name);
        Request::from_parts(parts)
    }

    pub fn with_body(&self, body: Option<Body>) -> Request {
        let mut parts = (*self.inner).clone();
        parts.body = body;
        Request::from_parts(parts)
    }

    /// True when both handles point at the same snapshot.
    pub fn same_snapshot(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn from_parts(parts: RequestParts) -> Request {
        Request {
            inner: Arc::new(parts),
        }
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    parts: RequestParts,
}

impl RequestBuilder {
    pub fn method(mut self, method: impl Into<Method>) -> Self {
        self.parts.method = method.into();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.parts.url = url.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.headers.append(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.parts.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.parts.body = Some(body.into());
        self
    }

    pub fn no_body(mut self) -> Self {
        self.parts.body = None;
        self
    }

    pub fn credentials(mut self, mode: CredentialsMode) -> Self {
        self.parts.credentials = mode;
        self
    }

    pub fn build(self) -> Request {
        Request::from_parts(self.parts)
    }
}

/// A response whose body each view may read once.
#[derive(Debug)]
pub struct Response {
    status: u16,
    status_text: String,
    headers: Headers,
    url: Option<String>,
    body: Option<Bytes>,
    used: bool,
}

impl Response {
    /// An empty response with the canonical reason phrase for `status`.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_text: canonical_reason(status).to_string(),
            headers: Headers::new(),
            url: None,
            body: None,
            used: false,
        }
    }

    /// Shorthand for a 200 response carrying `body`.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200).with_body(body)
    }

    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self.used = false;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn body_used(&self) -> bool {
        self.used
    }

    /// Consume this view's body. An absent body reads as empty.
    pub fn bytes(&mut self) -> Result<Bytes, TransportError> {
        if self.used {
            return Err(TransportError::BodyAlreadyRead);
        }
        self.used = true;
        Ok(self.body.clone().unwrap_or_default())
    }

    /// Consume the body as UTF-8, replacing invalid sequences.
    pub fn text(&mut self) -> Result<String, TransportError> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let bytes = self.bytes()?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// An independent, unread view of the same response.
    pub fn try_clone(&self) -> Result<Response, TransportError> {
        if self.used {
            return Err(TransportError::BodyAlreadyRead);
        }
        Ok(Response {
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            url: self.url.clone(),
            body: self.body.clone(),
            used: false,
        })
    }
}

/// Reason phrase for the statuses a transport commonly reports.
pub fn canonical_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        410 => "Gone",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
