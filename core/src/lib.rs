//! Network interception substrate.
//!
//! # Overview
//! Sits between page code and the host's two network primitives, an async
//! request/response call ([`AsyncTransport`]) and a legacy stateful object
//! ([`StatefulTransport`]), and routes both through one ordered pipeline of
//! consumer-registered filters. Request filters may rewrite, short-circuit or
//! abort a call; response filters may replace the result or synthesize one
//! when the network failed.
//!
//! # Design
//! - [`InterceptionContext`] owns the filter registries and the config; there
//!   is no hidden module state besides the optional [`global`] context.
//! - Installation replaces the [`Host`]'s primitive slots with marked
//!   wrappers ([`interposer`]), idempotently, and keeps them wrapped when the
//!   page reassigns a primitive.
//! - The stateful primitive is emulated by [`adapter::XhrAdapter`], which
//!   replays the filtered request onto the real object and forges the result
//!   the caller observes.
//! - A filter fault never breaks the page: faulting filters are skipped.

pub mod adapter;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod filter;
pub mod host;
pub mod http;
pub mod interposer;
pub mod pipeline;
pub mod transport;
pub mod types;

pub use adapter::{InterceptedXhrFactory, XhrAdapter};
pub use config::InterceptConfig;
pub use context::{global, register_request_filter, register_response_filter, Activation, InterceptionContext};
pub use deferred::{Bindings, OnSetMode};
pub use error::TransportError;
pub use filter::{FilterId, Registration, RequestAction, RequestFilter, ResponseFilter};
pub use host::{ExecutionContext, Host, HostPrimitive};
pub use http::{Body, CredentialsMode, FormData, Headers, Method, Request, Response};
pub use interposer::{InstallMode, Installation, Interposer, Layered, Marker, Slot};
pub use pipeline::{InterceptedTransport, RequestStage};
pub use transport::{AsyncTransport, StatefulTransport, StatefulTransportFactory};
pub use types::{EventListener, ReadyState, ResponseType, XhrBody, XhrEvent, XhrEventKind};
