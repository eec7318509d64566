//! Shared fixtures: scripted and real transports for both primitives.
//!
//! # Design
//! `NativeXhr` plays the host's stateful object. It performs its exchange
//! through any [`AsyncTransport`] and fires the event sequence a browser
//! object would, so the same type serves the scripted tests and the ones
//! that go over real HTTP to the mock server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use netfilter_core::{
    AsyncTransport, Body, CredentialsMode, EventListener, Headers, Layered, Method, ReadyState,
    Request, Response, ResponseType, StatefulTransport, StatefulTransportFactory, TransportError,
    XhrBody, XhrEvent, XhrEventKind,
};
use parking_lot::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// --- scripted async transport ---

type Reply = Box<dyn Fn(&Request) -> Result<Response, TransportError> + Send + Sync>;

/// Answers every call from a closure and remembers what it was sent.
pub struct Scripted {
    calls: AtomicUsize,
    seen: Mutex<Vec<Request>>,
    reply: Reply,
}

impl Scripted {
    pub fn with(
        reply: impl Fn(&Request) -> Result<Response, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            reply: Box::new(reply),
        })
    }

    /// Always answers `status` with `body`.
    pub fn ok(status: u16, body: &'static str) -> Arc<Self> {
        Self::with(move |_| {
            Ok(Response::new(status)
                .with_header("Content-Type", "text/plain")
                .with_body(body))
        })
    }

    /// Always fails at the network level.
    pub fn unreachable() -> Arc<Self> {
        Self::with(|request| Err(TransportError::Network(format!("{} unreachable", request.url()))))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Request> {
        self.seen.lock().clone()
    }

    pub fn last(&self) -> Option<Request> {
        self.seen.lock().last().cloned()
    }
}

impl Layered for Scripted {}

#[async_trait]
impl AsyncTransport for Scripted {
    async fn fetch(&self, request: Request) -> Result<Response, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());
        (self.reply)(&request)
    }
}

// --- real HTTP via ureq ---

/// Performs the exchange over real HTTP on the blocking pool.
pub struct UreqTransport;

impl Layered for UreqTransport {}

#[async_trait]
impl AsyncTransport for UreqTransport {
    async fn fetch(&self, request: Request) -> Result<Response, TransportError> {
        tokio::task::spawn_blocking(move || execute(&request))
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?
    }
}

/// Execute a `Request` using ureq, with 4xx/5xx returned as data.
fn execute(request: &Request) -> Result<Response, TransportError> {
    let agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .new_agent();
    let url = request.url();
    let body = match request.body() {
        Some(Body::Form(form)) => form.to_multipart().1,
        Some(body) => body.as_bytes().unwrap_or_default(),
        None => Bytes::new(),
    };

    macro_rules! with_headers {
        ($builder:expr) => {{
            let mut builder = $builder;
            for (name, value) in request.headers().iter() {
                builder = builder.header(name, value);
            }
            builder
        }};
    }

    let result = match request.method() {
        Method::Get => with_headers!(agent.get(url)).call(),
        Method::Head => with_headers!(agent.head(url)).call(),
        Method::Delete => with_headers!(agent.delete(url)).call(),
        Method::Post => with_headers!(agent.post(url)).send(&body[..]),
        Method::Put => with_headers!(agent.put(url)).send(&body[..]),
        Method::Patch => with_headers!(agent.patch(url)).send(&body[..]),
        other => return Err(TransportError::Network(format!("unsupported method {other}"))),
    };
    let mut response = result.map_err(|e| TransportError::Network(e.to_string()))?;

    let status = response.status();
    let headers: Headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let data = response
        .body_mut()
        .read_to_vec()
        .map_err(|e| TransportError::Network(e.to_string()))?;

    Ok(Response::new(status.as_u16())
        .with_status_text(status.canonical_reason().unwrap_or_default())
        .with_headers(headers)
        .with_body(data)
        .with_url(url))
}

/// Start the mock server on a random port; returns its base URL and hit counter.
pub fn spawn_server() -> (String, mock_server::Hits) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let hits = mock_server::Hits::default();
    let served = hits.clone();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run_with_hits(listener, served).await
        })
        .unwrap();
    });

    (format!("http://{addr}"), hits)
}

// --- the host's stateful object ---

/// A stateful transport object that behaves like the browser's.
pub struct NativeXhr {
    transport: Arc<dyn AsyncTransport>,
    listeners: Vec<EventListener>,
    method: Method,
    url: String,
    headers: Headers,
    response_type: ResponseType,
    with_credentials: bool,
    state: ReadyState,
    status: u16,
    status_text: String,
    response_headers: Headers,
    response_url: Option<String>,
    body: Option<XhrBody>,
}

impl NativeXhr {
    pub fn new(transport: Arc<dyn AsyncTransport>) -> Self {
        Self {
            transport,
            listeners: Vec::new(),
            method: Method::Get,
            url: String::new(),
            headers: Headers::new(),
            response_type: ResponseType::Text,
            with_credentials: false,
            state: ReadyState::Unsent,
            status: 0,
            status_text: String::new(),
            response_headers: Headers::new(),
            response_url: None,
            body: None,
        }
    }

    fn fire(&mut self, kind: XhrEventKind) {
        let event = XhrEvent::new(kind, self.state);
        for listener in &mut self.listeners {
            listener(&event);
        }
    }

    fn advance(&mut self, state: ReadyState) {
        self.state = state;
        self.fire(XhrEventKind::ReadyStateChange);
    }
}

#[async_trait]
impl StatefulTransport for NativeXhr {
    fn open(&mut self, method: Method, url: &str, _is_async: bool) -> Result<(), TransportError> {
        self.method = method;
        self.url = url.to_string();
        self.headers.clear();
        self.status = 0;
        self.status_text.clear();
        self.response_headers.clear();
        self.body = None;
        self.advance(ReadyState::Opened);
        Ok(())
    }

    fn set_request_header(&mut self, name: &str, value: &str) -> Result<(), TransportError> {
        if self.state != ReadyState::Opened {
            return Err(TransportError::InvalidState("not opened"));
        }
        self.headers.append(name, value);
        Ok(())
    }

    fn set_response_type(&mut self, response_type: ResponseType) -> Result<(), TransportError> {
        self.response_type = response_type;
        Ok(())
    }

    fn response_type(&self) -> ResponseType {
        self.response_type
    }

    fn set_with_credentials(&mut self, with_credentials: bool) {
        self.with_credentials = with_credentials;
    }

    fn with_credentials(&self) -> bool {
        self.with_credentials
    }

    fn add_event_listener(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    async fn send(&mut self, body: Option<Body>) -> Result<(), TransportError> {
        if self.state != ReadyState::Opened {
            return Err(TransportError::InvalidState("not opened"));
        }
        self.fire(XhrEventKind::LoadStart);

        let credentials = if self.with_credentials {
            CredentialsMode::Include
        } else {
            CredentialsMode::SameOrigin
        };
        let mut builder = Request::builder(self.url.clone())
            .method(self.method.clone())
            .headers(self.headers.clone())
            .credentials(credentials);
        match body.filter(|_| self.method.allows_body()) {
            Some(Body::Form(form)) => {
                let (content_type, data) = form.to_multipart();
                builder = builder.header("Content-Type", content_type).body(data);
            }
            Some(body) => {
                if let (Some(ct), false) = (body.default_content_type(), self.headers.contains("content-type")) {
                    builder = builder.header("Content-Type", ct);
                }
                builder = builder.body(body);
            }
            None => {}
        }

        match self.transport.fetch(builder.build()).await {
            Ok(mut response) => {
                self.status = response.status();
                self.status_text = response.status_text().to_string();
                self.response_headers = response.headers().clone();
                self.response_url = Some(response.url().unwrap_or(&self.url).to_string());
                self.advance(ReadyState::HeadersReceived);
                self.advance(ReadyState::Loading);
                let data = response.bytes()?;
                self.body = match self.response_type {
                    ResponseType::Text => Some(XhrBody::Text(String::from_utf8_lossy(&data).into_owned())),
                    ResponseType::Document => {
                        Some(XhrBody::Document(String::from_utf8_lossy(&data).into_owned()))
                    }
                    ResponseType::Json => serde_json::from_slice(&data).ok().map(XhrBody::Json),
                    ResponseType::ArrayBuffer => Some(XhrBody::ArrayBuffer(data)),
                    ResponseType::Blob => Some(XhrBody::Blob {
                        content_type: self.response_headers.get("content-type").unwrap_or_default(),
                        data,
                    }),
                };
                self.advance(ReadyState::Done);
                self.fire(XhrEventKind::Load);
            }
            Err(TransportError::Aborted) => {
                self.state = ReadyState::Unsent;
                return Err(TransportError::Aborted);
            }
            Err(_) => {
                self.status = 0;
                self.advance(ReadyState::Done);
                self.fire(XhrEventKind::Error);
            }
        }
        self.fire(XhrEventKind::LoadEnd);
        Ok(())
    }

    fn abort(&mut self) {
        self.state = ReadyState::Unsent;
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    fn status(&self) -> u16 {
        self.status
    }

    fn status_text(&self) -> String {
        self.status_text.clone()
    }

    fn get_response_header(&self, name: &str) -> Option<String> {
        self.response_headers.get(name)
    }

    fn get_all_response_headers(&self) -> String {
        self.response_headers.to_raw()
    }

    fn response(&self) -> Option<XhrBody> {
        self.body.clone()
    }

    fn response_text(&self) -> Result<String, TransportError> {
        match &self.body {
            Some(XhrBody::Text(text)) => Ok(text.clone()),
            _ => Ok(String::new()),
        }
    }

    fn response_url(&self) -> Option<String> {
        self.response_url.clone()
    }
}

pub struct NativeXhrFactory {
    transport: Arc<dyn AsyncTransport>,
}

impl NativeXhrFactory {
    pub fn new(transport: Arc<dyn AsyncTransport>) -> Arc<Self> {
        Arc::new(Self { transport })
    }
}

impl Layered for NativeXhrFactory {}

impl StatefulTransportFactory for NativeXhrFactory {
    fn create(&self) -> Box<dyn StatefulTransport> {
        Box::new(NativeXhr::new(Arc::clone(&self.transport)))
    }
}

/// Collect every event `xhr` fires from now on.
pub fn record(xhr: &mut dyn StatefulTransport) -> Arc<Mutex<Vec<XhrEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    xhr.add_event_listener(Box::new(move |event: &XhrEvent| sink.lock().push(*event)));
    events
}

pub fn count(events: &[XhrEvent], kind: XhrEventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}
