//! Stateful transport emulation.
//!
//! # Design
//! [`XhrAdapter`] wraps one real [`StatefulTransport`] object and presents
//! the same trait to the caller. It keeps the session as an explicit state
//! machine (`Unsent -> Opened -> Done`, with the primitive's own
//! `HeadersReceived`/`Loading` collapsed into the send) and rejects calls
//! made out of order.
//!
//! On `send` the accumulated session becomes a canonical [`Request`] and
//! goes through the same request filters as the async primitive. A
//! short-circuit or an abort never touches the real object. Otherwise the
//! final request is replayed onto the real object, and when it finishes the
//! response goes through the same response filters, including the fallback
//! pass when the primitive reports a transport failure.
//!
//! The caller never sees the real object's completion signals. A capture
//! listener on the real object forwards progress events but holds back every
//! terminal one; the adapter fires its own `readystatechange(Done)`,
//! `load`/`error` and `loadend` after the response fields have been forged
//! from the pipeline's outcome, exactly once per send cycle. Document
//! results and bypassed requests are the exception: their events pass
//! through untouched and the response is copied as is.
//!
//! When replaying a structured form body, a multipart `Content-Type` header
//! is dropped so that the primitive generates the boundary for the form it
//! is given. Pre-encoded multipart bytes keep the caller's header.
//!
//! Only a hard network failure (or a status of 0) gets the fallback pass.
//! Any other error from the real object is returned from `send` as is.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::context::InterceptionContext;
use crate::error::TransportError;
use crate::http::{
    is_multipart, is_textual, validate_header, Body, CredentialsMode, Headers, Method, Request,
    Response,
};
use crate::interposer::{Layered, Marker};
use crate::pipeline::RequestStage;
use crate::transport::{StatefulTransport, StatefulTransportFactory};
use crate::types::{EventListener, ReadyState, ResponseType, XhrBody, XhrEvent, XhrEventKind};

/// The interposed stateful primitive factory.
pub struct InterceptedXhrFactory {
    context: Arc<InterceptionContext>,
    inner: Arc<dyn StatefulTransportFactory>,
    marker: Marker,
}

impl InterceptedXhrFactory {
    pub fn new(
        context: Arc<InterceptionContext>,
        inner: Arc<dyn StatefulTransportFactory>,
        marker: Marker,
    ) -> Self {
        Self {
            context,
            inner,
            marker,
        }
    }
}

impl Layered for InterceptedXhrFactory {
    fn layer_marker(&self) -> Option<Marker> {
        Some(self.marker)
    }

    fn inner_layer(&self) -> Option<&dyn Layered> {
        Some(&*self.inner)
    }
}

impl StatefulTransportFactory for InterceptedXhrFactory {
    fn create(&self) -> Box<dyn StatefulTransport> {
        Box::new(XhrAdapter::new(Arc::clone(&self.context), self.inner.create()))
    }
}

/// Event plumbing shared with the capture listener on the real object.
#[derive(Default)]
struct Relay {
    listeners: Vec<EventListener>,
    /// Set once the cycle's terminal signals have been delivered.
    finalized: bool,
    /// Let the real object's events through untouched.
    passthrough: bool,
    suppressed: usize,
}

impl Relay {
    fn dispatch(&mut self, event: &XhrEvent) {
        for listener in &mut self.listeners {
            listener(event);
        }
    }

    /// Capture-phase handling of an event fired by the real object.
    fn capture(&mut self, event: &XhrEvent) {
        // open() and send() announce themselves from the adapter.
        let owned_by_adapter = event.kind == XhrEventKind::LoadStart
            || *event == XhrEvent::ready_state_change(ReadyState::Opened);
        if owned_by_adapter {
            return;
        }
        if self.passthrough || !event.is_terminal() {
            self.dispatch(event);
        } else {
            self.suppressed += 1;
            tracing::trace!(kind = ?event.kind, "holding back terminal event");
        }
    }
}

/// Response fields shown to the caller.
#[derive(Debug, Default)]
struct Forged {
    status: u16,
    status_text: String,
    headers: Headers,
    url: Option<String>,
    body: Option<XhrBody>,
}

#[derive(Debug, Default)]
struct Session {
    method: Method,
    url: String,
    is_async: bool,
    request_headers: Headers,
    response_type: ResponseType,
    with_credentials: bool,
    ready_state: ReadyState,
    sending: bool,
    forged: Option<Forged>,
}

/// A stateful transport object that routes through the filter pipeline.
pub struct XhrAdapter {
    context: Arc<InterceptionContext>,
    inner: Box<dyn StatefulTransport>,
    session: Session,
    relay: Arc<Mutex<Relay>>,
}

impl XhrAdapter {
    pub fn new(context: Arc<InterceptionContext>, mut inner: Box<dyn StatefulTransport>) -> Self {
        let relay = Arc::new(Mutex::new(Relay::default()));
        let capture = Arc::clone(&relay);
        inner.add_event_listener(Box::new(move |event: &XhrEvent| capture.lock().capture(event)));
        Self {
            context,
            inner,
            session: Session::default(),
            relay,
        }
    }

    /// Terminal events of the real object withheld from the caller so far.
    pub fn suppressed_events(&self) -> usize {
        self.relay.lock().suppressed
    }

    fn emit(&self, event: XhrEvent) {
        self.relay.lock().dispatch(&event);
    }

    /// Deliver the cycle's terminal signals, at most once.
    fn emit_terminal(&mut self, kind: XhrEventKind) {
        let state = self.session.ready_state;
        let mut relay = self.relay.lock();
        if relay.finalized {
            return;
        }
        relay.finalized = true;
        if state == ReadyState::Done {
            relay.dispatch(&XhrEvent::ready_state_change(ReadyState::Done));
        }
        relay.dispatch(&XhrEvent::new(kind, state));
        relay.dispatch(&XhrEvent::new(XhrEventKind::LoadEnd, state));
    }

    fn begin_cycle(&mut self) {
        self.session.sending = true;
        self.session.forged = None;
        let mut relay = self.relay.lock();
        relay.finalized = false;
        relay.passthrough = false;
    }

    fn build_request(&self, body: Option<Body>) -> Request {
        let session = &self.session;
        let credentials = if session.with_credentials {
            CredentialsMode::Include
        } else {
            CredentialsMode::SameOrigin
        };
        let mut builder = Request::builder(session.url.clone())
            .method(session.method.clone())
            .headers(session.request_headers.clone())
            .credentials(credentials);
        if let Some(body) = body.filter(|_| session.method.allows_body()) {
            // Forms get their multipart type, with its boundary, from the primitive.
            let implied = match body {
                Body::Form(_) => None,
                _ => body.default_content_type(),
            };
            if let (Some(ct), false) = (implied, session.request_headers.contains("content-type")) {
                builder = builder.header("Content-Type", ct);
            }
            builder = builder.body(body);
        }
        builder.build()
    }

    /// Re-issue `open` and the headers of `request` on the real object.
    fn replay(
        &mut self,
        request: &Request,
        body: Option<&Body>,
        response_type: ResponseType,
    ) -> Result<(), TransportError> {
        self.inner
            .open(request.method().clone(), request.url(), self.session.is_async)?;
        let form = matches!(body, Some(Body::Form(_)));
        for (name, value) in request.headers().iter() {
            if form && name.eq_ignore_ascii_case("content-type") && is_multipart(value) {
                continue;
            }
            self.inner.set_request_header(name, value)?;
        }
        self.inner.set_response_type(response_type)?;
        self.inner
            .set_with_credentials(request.credentials() == CredentialsMode::Include);
        Ok(())
    }

    /// Replay `request` and run it on the real object.
    async fn exchange(&mut self, request: &Request, response_type: ResponseType) -> Result<(), TransportError> {
        let body = wire_body(request);
        self.replay(request, body.as_ref(), response_type)?;
        self.inner.send(body).await
    }

    /// Canonical response built from the real object's fields.
    fn read_inner(&self) -> Response {
        let headers = Headers::parse_raw(&self.inner.get_all_response_headers());
        let body = self
            .inner
            .response()
            .map(|body| body.to_bytes())
            .unwrap_or_default();
        let response = Response::new(self.inner.status())
            .with_status_text(self.inner.status_text())
            .with_headers(headers)
            .with_body(body);
        match self.inner.response_url() {
            Some(url) => response.with_url(url),
            None => response,
        }
    }

    async fn forward(&mut self, request: Request) -> Result<(), TransportError> {
        let outcome = match self.exchange(&request, ResponseType::ArrayBuffer).await {
            Ok(()) if self.inner.status() != 0 => Ok(self.read_inner()),
            Ok(()) => Err(TransportError::Network(format!(
                "{} {} failed",
                request.method(),
                request.url()
            ))),
            Err(err) => Err(err),
        };

        let response = match outcome {
            Ok(response) => Some(self.context.filter_response(&request, response).await),
            Err(err) if err.is_network() => {
                tracing::debug!(url = request.url(), error = %err, "stateful transport failed; trying fallback");
                self.context.run_response_filters(&request, None).await
            }
            Err(err) => {
                tracing::debug!(url = request.url(), error = %err, "stateful transport error passed through");
                self.relay.lock().finalized = true;
                self.session.forged = None;
                self.session.ready_state = self.inner.ready_state();
                return Err(err);
            }
        };

        match response {
            Some(response) => self.complete(response),
            None => self.fail(ReadyState::Done, XhrEventKind::Error),
        }
        Ok(())
    }

    /// Let the real object handle the cycle and mirror what it produced.
    async fn pass_through(&mut self, request: Request) -> Result<(), TransportError> {
        self.relay.lock().passthrough = true;
        let response_type = self.session.response_type;
        let sent = self.exchange(&request, response_type).await;
        self.relay.lock().finalized = true;
        sent?;
        self.session.ready_state = self.inner.ready_state();
        if self.inner.status() != 0 {
            self.session.forged = Some(Forged {
                status: self.inner.status(),
                status_text: self.inner.status_text(),
                headers: Headers::parse_raw(&self.inner.get_all_response_headers()),
                url: self.inner.response_url(),
                body: self.inner.response(),
            });
        }
        Ok(())
    }

    /// Forge the caller-visible fields from `response` and signal success.
    fn complete(&mut self, mut response: Response) {
        let data = match response.bytes() {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!(error = %err, "response body unavailable");
                return self.fail(ReadyState::Done, XhrEventKind::Error);
            }
        };
        let content_type = response.headers().get("content-type");
        self.session.forged = Some(Forged {
            status: response.status(),
            status_text: response.status_text().to_string(),
            headers: response.headers().clone(),
            url: response.url().map(str::to_string),
            body: materialize(self.session.response_type, data, content_type),
        });
        self.session.ready_state = ReadyState::Done;
        self.emit_terminal(XhrEventKind::Load);
    }

    fn fail(&mut self, state: ReadyState, kind: XhrEventKind) {
        self.session.forged = None;
        self.session.ready_state = state;
        self.emit_terminal(kind);
    }
}

#[async_trait]
impl StatefulTransport for XhrAdapter {
    fn open(&mut self, method: Method, url: &str, is_async: bool) -> Result<(), TransportError> {
        self.inner.open(method.clone(), url, is_async)?;
        self.session = Session {
            method,
            url: url.to_string(),
            is_async,
            request_headers: Headers::new(),
            response_type: self.session.response_type,
            with_credentials: self.session.with_credentials,
            ready_state: ReadyState::Opened,
            sending: false,
            forged: None,
        };
        self.relay.lock().finalized = false;
        self.emit(XhrEvent::ready_state_change(ReadyState::Opened));
        Ok(())
    }

    fn set_request_header(&mut self, name: &str, value: &str) -> Result<(), TransportError> {
        if self.session.ready_state != ReadyState::Opened || self.session.sending {
            return Err(TransportError::InvalidState("set_request_header() requires an opened, idle object"));
        }
        validate_header(name, value)?;
        self.session.request_headers.append(name, value);
        Ok(())
    }

    fn set_response_type(&mut self, response_type: ResponseType) -> Result<(), TransportError> {
        if matches!(self.session.ready_state, ReadyState::Loading | ReadyState::Done) || self.session.sending {
            return Err(TransportError::InvalidState("response_type is fixed once loading starts"));
        }
        self.session.response_type = response_type;
        Ok(())
    }

    fn response_type(&self) -> ResponseType {
        self.session.response_type
    }

    fn set_with_credentials(&mut self, with_credentials: bool) {
        self.session.with_credentials = with_credentials;
    }

    fn with_credentials(&self) -> bool {
        self.session.with_credentials
    }

    fn add_event_listener(&mut self, listener: EventListener) {
        self.relay.lock().listeners.push(listener);
    }

    async fn send(&mut self, body: Option<Body>) -> Result<(), TransportError> {
        let idle = matches!(self.session.ready_state, ReadyState::Opened | ReadyState::Done);
        if !idle || self.session.sending {
            return Err(TransportError::InvalidState("send() requires an opened, idle object"));
        }
        self.begin_cycle();
        let request = self.build_request(body);
        self.emit(XhrEvent::new(XhrEventKind::LoadStart, ReadyState::Opened));

        let result = if self.context.is_bypassed(request.url()) {
            tracing::trace!(url = request.url(), "bypassing interception");
            self.pass_through(request).await
        } else {
            match self.context.run_request_filters(request).await {
                RequestStage::Respond(response) => {
                    self.complete(response);
                    Ok(())
                }
                RequestStage::Aborted => {
                    self.fail(ReadyState::Unsent, XhrEventKind::Error);
                    Ok(())
                }
                RequestStage::Forward(request) if self.session.response_type == ResponseType::Document => {
                    self.pass_through(request).await
                }
                RequestStage::Forward(request) => self.forward(request).await,
            }
        };
        self.session.sending = false;
        result
    }

    fn abort(&mut self) {
        self.inner.abort();
        if self.session.sending {
            self.session.ready_state = ReadyState::Done;
            self.session.forged = None;
            self.emit_terminal(XhrEventKind::Abort);
        }
        self.session.sending = false;
        self.session.forged = None;
        self.session.ready_state = ReadyState::Unsent;
    }

    fn ready_state(&self) -> ReadyState {
        self.session.ready_state
    }

    fn status(&self) -> u16 {
        self.session.forged.as_ref().map_or(0, |f| f.status)
    }

    fn status_text(&self) -> String {
        self.session
            .forged
            .as_ref()
            .map(|f| f.status_text.clone())
            .unwrap_or_default()
    }

    fn get_response_header(&self, name: &str) -> Option<String> {
        self.session.forged.as_ref()?.headers.get(name)
    }

    fn get_all_response_headers(&self) -> String {
        self.session
            .forged
            .as_ref()
            .map(|f| f.headers.to_raw())
            .unwrap_or_default()
    }

    fn response(&self) -> Option<XhrBody> {
        self.session.forged.as_ref()?.body.clone()
    }

    fn response_text(&self) -> Result<String, TransportError> {
        if self.session.response_type != ResponseType::Text {
            return Err(TransportError::InvalidState("response_text() requires the text response type"));
        }
        Ok(match self.response() {
            Some(XhrBody::Text(text)) => text,
            _ => String::new(),
        })
    }

    fn response_url(&self) -> Option<String> {
        self.session.forged.as_ref()?.url.clone()
    }
}

/// Body to hand the real object, re-encoded after its declared content type:
/// text and JSON as text, forms as structured parts, everything else as raw
/// bytes.
fn wire_body(request: &Request) -> Option<Body> {
    let body = request.body()?;
    if !request.method().allows_body() {
        return None;
    }
    let content_type = request.headers().get("content-type").unwrap_or_default();
    let textual = content_type.is_empty() || is_textual(&content_type);
    Some(match body {
        Body::Form(form) => Body::Form(form.clone()),
        Body::Text(text) if textual => Body::Text(text.clone()),
        Body::Binary(bytes) if !content_type.is_empty() && is_textual(&content_type) => {
            Body::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        other => Body::Binary(other.as_bytes().unwrap_or_default()),
    })
}

/// Shape `data` the way the caller asked for. Malformed JSON yields no body,
/// as it does natively.
fn materialize(response_type: ResponseType, data: Bytes, content_type: Option<String>) -> Option<XhrBody> {
    match response_type {
        ResponseType::Text => Some(XhrBody::Text(String::from_utf8_lossy(&data).into_owned())),
        ResponseType::Document => Some(XhrBody::Document(String::from_utf8_lossy(&data).into_owned())),
        ResponseType::Json => serde_json::from_slice(&data).ok().map(XhrBody::Json),
        ResponseType::ArrayBuffer => Some(XhrBody::ArrayBuffer(data)),
        ResponseType::Blob => Some(XhrBody::Blob {
            content_type: content_type.unwrap_or_default(),
            data,
        }),
    }
}
