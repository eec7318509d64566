//! The interception context: filter registries plus installation.
//!
//! # Design
//! Instead of module-level registries, all shared state lives in an
//! explicitly constructed [`InterceptionContext`], which is handed to
//! whatever performs installation. [`global`] offers a lazily built
//! process-wide context for callers that just want to register a filter.
//!
//! The registries are the only shared mutable state. They are only mutated
//! synchronously from the registration API; in-flight pipelines work from
//! snapshots (see [`crate::filter`]).

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::adapter::InterceptedXhrFactory;
use crate::config::InterceptConfig;
use crate::deferred::OnSetMode;
use crate::filter::{FilterRegistry, Registration, RequestFilter, ResponseFilter};
use crate::host::{Host, FETCH_KEY, XHR_KEY};
use crate::interposer::{InstallMode, Interposer, Marker};
use crate::pipeline::InterceptedTransport;
use crate::transport::{AsyncTransport, StatefulTransportFactory};

/// Outcome of an install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Both primitive slots are interposed.
    Installed,
    /// The host is not a page-injection context; nothing was touched.
    Skipped,
}

pub struct InterceptionContext {
    config: InterceptConfig,
    pub(crate) request_filters: FilterRegistry<dyn RequestFilter>,
    pub(crate) response_filters: FilterRegistry<dyn ResponseFilter>,
    async_marker: Marker,
    stateful_marker: Marker,
}

impl std::fmt::Debug for InterceptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionContext")
            .field("config", &self.config)
            .field("request_filters", &self.request_filters.len())
            .field("response_filters", &self.response_filters.len())
            .finish()
    }
}

impl InterceptionContext {
    pub fn new(config: InterceptConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            request_filters: FilterRegistry::new(),
            response_filters: FilterRegistry::new(),
            async_marker: Marker::new(),
            stateful_marker: Marker::new(),
        })
    }

    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    pub fn register_request_filter<F: RequestFilter + 'static>(&self, filter: F) -> Registration {
        self.request_filters.register(Arc::new(filter))
    }

    /// Register a shared filter; registering the same `Arc` again is a no-op.
    pub fn register_request_filter_arc(&self, filter: Arc<dyn RequestFilter>) -> Registration {
        self.request_filters.register(filter)
    }

    pub fn register_response_filter<F: ResponseFilter + 'static>(&self, filter: F) -> Registration {
        self.response_filters.register(Arc::new(filter))
    }

    pub fn register_response_filter_arc(&self, filter: Arc<dyn ResponseFilter>) -> Registration {
        self.response_filters.register(filter)
    }

    pub fn request_filter_count(&self) -> usize {
        self.request_filters.len()
    }

    pub fn response_filter_count(&self) -> usize {
        self.response_filters.len()
    }

    /// Interposer for the async primitive, bound to this context.
    pub fn async_interposer(self: &Arc<Self>) -> Interposer<dyn AsyncTransport> {
        let context = Arc::clone(self);
        Interposer::<dyn AsyncTransport>::with_marker(self.async_marker, move |marker, inner| {
            Arc::new(InterceptedTransport::new(Arc::clone(&context), inner, marker))
                as Arc<dyn AsyncTransport>
        })
    }

    /// Interposer for the stateful primitive's factory, bound to this context.
    pub fn stateful_interposer(self: &Arc<Self>) -> Interposer<dyn StatefulTransportFactory> {
        let context = Arc::clone(self);
        Interposer::<dyn StatefulTransportFactory>::with_marker(self.stateful_marker, move |marker, inner| {
            Arc::new(InterceptedXhrFactory::new(Arc::clone(&context), inner, marker))
                as Arc<dyn StatefulTransportFactory>
        })
    }

    /// Interpose both primitive slots of `host`, if it is a page-injection
    /// context. Installing twice is harmless.
    pub fn install(self: &Arc<Self>, host: &Host) -> Activation {
        if !host.context().is_page_injection() {
            tracing::info!(context = ?host.context(), "not a page context; interception skipped");
            return Activation::Skipped;
        }
        let mode = self.config.install_mode;
        let fetch = host.fetch_slot().install(&self.async_interposer(), mode);
        let xhr = host.xhr_slot().install(&self.stateful_interposer(), mode);
        if mode == InstallMode::Fixed && !(host.fetch_slot().is_bound() && host.xhr_slot().is_bound()) {
            tracing::warn!("fixed install on a host with unbound primitives");
        }
        tracing::info!(?fetch, ?xhr, "interception installed");
        Activation::Installed
    }

    /// Wait until the host has published both primitives, then install.
    ///
    /// Resolves immediately for non-page contexts. Never resolves if a
    /// primitive is never bound.
    pub async fn install_deferred(self: &Arc<Self>, host: &Host) -> Activation {
        if !host.context().is_page_injection() {
            return self.install(host);
        }
        host.globals()
            .multi_on_set(&[FETCH_KEY, XHR_KEY], OnSetMode::Current)
            .await;
        self.install(host)
    }
}

static GLOBAL: Lazy<Arc<InterceptionContext>> =
    Lazy::new(|| InterceptionContext::new(InterceptConfig::from_env()));

/// The process-wide context, configured from the environment on first use.
pub fn global() -> &'static Arc<InterceptionContext> {
    &GLOBAL
}

/// Register a request filter on the [`global`] context.
pub fn register_request_filter<F: RequestFilter + 'static>(filter: F) -> Registration {
    global().register_request_filter(filter)
}

/// Register a response filter on the [`global`] context.
pub fn register_response_filter<F: ResponseFilter + 'static>(filter: F) -> Registration {
    global().register_response_filter(filter)
}
