//! The host environment the substrate installs itself into.
//!
//! A [`Host`] owns the two primitive slots the page's code calls through,
//! plus a binding table on which primitives are published. Primitives may be
//! bound late, after the substrate has started; see
//! `InterceptionContext::install_deferred`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::parse_token;
use crate::deferred::Bindings;
use crate::error::TransportError;
use crate::http::{Request, Response};
use crate::interposer::Slot;
use crate::transport::{AsyncTransport, StatefulTransport, StatefulTransportFactory};

pub const ENV_CONTEXT: &str = "NETFILTER_CONTEXT";

/// Binding key of the async primitive.
pub const FETCH_KEY: &str = "fetch";
/// Binding key of the stateful primitive's factory.
pub const XHR_KEY: &str = "XMLHttpRequest";

/// Where the current code runs. Only `PageInjection` gets interception.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    PageInjection,
    ContentScript,
    #[default]
    Background,
    Popup,
}

impl ExecutionContext {
    /// Read from `NETFILTER_CONTEXT`; unset or unknown means `Background`.
    pub fn from_env() -> Self {
        std::env::var(ENV_CONTEXT)
            .ok()
            .and_then(|v| parse_token(&v))
            .unwrap_or_default()
    }

    pub fn is_page_injection(self) -> bool {
        self == ExecutionContext::PageInjection
    }
}

/// A primitive published on the host's binding table.
#[derive(Clone)]
pub enum HostPrimitive {
    Async(Arc<dyn AsyncTransport>),
    Stateful(Arc<dyn StatefulTransportFactory>),
}

pub struct Host {
    context: ExecutionContext,
    fetch: Slot<dyn AsyncTransport>,
    xhr: Slot<dyn StatefulTransportFactory>,
    globals: Bindings<HostPrimitive>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("context", &self.context)
            .field("fetch", &self.fetch)
            .field("xhr", &self.xhr)
            .finish()
    }
}

impl Host {
    /// A host whose primitives have not been bound yet.
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            fetch: Slot::vacant(),
            xhr: Slot::vacant(),
            globals: Bindings::new(),
        }
    }

    pub fn with_transports(
        context: ExecutionContext,
        fetch: Arc<dyn AsyncTransport>,
        xhr: Arc<dyn StatefulTransportFactory>,
    ) -> Self {
        let host = Self::new(context);
        host.bind_fetch(fetch);
        host.bind_xhr(xhr);
        host
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn fetch_slot(&self) -> &Slot<dyn AsyncTransport> {
        &self.fetch
    }

    pub fn xhr_slot(&self) -> &Slot<dyn StatefulTransportFactory> {
        &self.xhr
    }

    pub fn globals(&self) -> &Bindings<HostPrimitive> {
        &self.globals
    }

    /// (Re)assign the async primitive.
    pub fn bind_fetch(&self, transport: Arc<dyn AsyncTransport>) {
        self.fetch.assign(Arc::clone(&transport));
        self.globals.assign(FETCH_KEY, HostPrimitive::Async(transport));
    }

    /// (Re)assign the stateful primitive's factory.
    pub fn bind_xhr(&self, factory: Arc<dyn StatefulTransportFactory>) {
        self.xhr.assign(Arc::clone(&factory));
        self.globals.assign(XHR_KEY, HostPrimitive::Stateful(factory));
    }

    /// Call the async primitive the way page code does: through the slot.
    pub async fn fetch(&self, request: Request) -> Result<Response, TransportError> {
        let transport = self
            .fetch
            .get()
            .ok_or(TransportError::InvalidState("fetch is not bound"))?;
        transport.fetch(request).await
    }

    /// Construct a stateful transport object through the slot.
    pub fn create_xhr(&self) -> Result<Box<dyn StatefulTransport>, TransportError> {
        let factory = self
            .xhr
            .get()
            .ok_or(TransportError::InvalidState("XMLHttpRequest is not bound"))?;
        Ok(factory.create())
    }
}
