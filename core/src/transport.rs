//! Seams for the two host-provided transport primitives.
//!
//! # Design
//! The host does the I/O: it supplies an [`AsyncTransport`] (one-shot,
//! future-returning) and a [`StatefulTransportFactory`] that creates
//! long-lived [`StatefulTransport`] objects with readiness states and events.
//! The substrate interposes both through their slots and hands callers
//! wrappers implementing the very same traits, so calling code cannot tell
//! whether it is talking to the host or to the pipeline.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::http::{Body, Method, Request, Response};
use crate::interposer::Layered;
use crate::types::{EventListener, ReadyState, ResponseType, XhrBody};

/// The promise-style, one-shot request primitive.
#[async_trait]
pub trait AsyncTransport: Layered {
    async fn fetch(&self, request: Request) -> Result<Response, TransportError>;
}

/// The legacy stateful request object.
///
/// Calls follow the object's own lifecycle: `open`, any number of
/// `set_request_header`, then `send`. `send` resolves once the object has
/// reached its terminal state and fired its completion events; transport
/// failures are reported through the error event and a zero status, not as
/// an `Err`. `Err` is reserved for calls made in the wrong state.
#[async_trait]
pub trait StatefulTransport: Send {
    fn open(&mut self, method: Method, url: &str, is_async: bool) -> Result<(), TransportError>;

    fn set_request_header(&mut self, name: &str, value: &str) -> Result<(), TransportError>;

    fn set_response_type(&mut self, response_type: ResponseType) -> Result<(), TransportError>;

    fn response_type(&self) -> ResponseType;

    fn set_with_credentials(&mut self, with_credentials: bool);

    fn with_credentials(&self) -> bool;

    fn add_event_listener(&mut self, listener: EventListener);

    async fn send(&mut self, body: Option<Body>) -> Result<(), TransportError>;

    /// Cancel the in-flight cycle, if any.
    fn abort(&mut self);

    fn ready_state(&self) -> ReadyState;

    /// Zero until a response exists, and after a transport failure.
    fn status(&self) -> u16;

    fn status_text(&self) -> String;

    fn get_response_header(&self, name: &str) -> Option<String>;

    /// Raw CRLF-delimited header blob.
    fn get_all_response_headers(&self) -> String;

    /// The body in the shape selected by `response_type`.
    fn response(&self) -> Option<XhrBody>;

    /// Only valid for the text response type.
    fn response_text(&self) -> Result<String, TransportError>;

    fn response_url(&self) -> Option<String>;
}

/// Creates stateful transport objects; this is the slot that gets interposed.
pub trait StatefulTransportFactory: Layered {
    fn create(&self) -> Box<dyn StatefulTransport>;
}
