//! The request pipeline: request filters, transport, response filters.
//!
//! # Design
//! Both transports funnel through the same two passes defined here:
//!
//! 1. [`InterceptionContext::run_request_filters`] walks the request filters
//!    in registration order. A filter may replace the request, short-circuit
//!    with a response, or abort. A filter that fails or panics is skipped and
//!    the request it was given stays current (fail-open). Each call sits
//!    inside its own `catch_unwind` boundary and nothing wider.
//! 2. [`InterceptionContext::run_response_filters`] walks the response
//!    filters. It runs on success with the transport's response, and on a
//!    hard network failure with no response at all, which is what lets a
//!    consumer serve a synthetic response when the network is unreachable.
//!
//! Requests whose URL carries the configured bypass marker skip both passes
//! so the substrate's host can issue its own calls without recursing.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::context::InterceptionContext;
use crate::error::TransportError;
use crate::filter::{FilterEntry, RequestAction, ResponseFilter};
use crate::http::{Request, Response};
use crate::interposer::{Layered, Marker};
use crate::transport::AsyncTransport;

/// Where the request filters left a request.
#[derive(Debug)]
pub enum RequestStage {
    /// Go to the network with this (possibly rewritten) request.
    Forward(Request),
    /// A filter supplied the response; the network is skipped.
    Respond(Response),
    /// A filter aborted the call.
    Aborted,
}

impl InterceptionContext {
    pub fn is_bypassed(&self, url: &str) -> bool {
        let marker = self.config().bypass_marker.as_str();
        !marker.is_empty() && url.contains(marker)
    }

    pub async fn run_request_filters(&self, request: Request) -> RequestStage {
        let mut current = request;
        for entry in self.request_filters.snapshot() {
            if !self.request_filters.is_live(entry.id) {
                continue;
            }
            let outcome = AssertUnwindSafe(entry.filter.on_request(current.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(RequestAction::Continue)) => {}
                Ok(Ok(RequestAction::Replace(next))) => current = next,
                Ok(Ok(RequestAction::Respond(response))) if response.body_used() => {
                    tracing::debug!(filter = ?entry.id, "request filter responded with a consumed body");
                }
                Ok(Ok(RequestAction::Respond(response))) => {
                    tracing::debug!(filter = ?entry.id, url = current.url(), "request short-circuited");
                    return RequestStage::Respond(response);
                }
                Ok(Ok(RequestAction::Abort)) => {
                    tracing::debug!(filter = ?entry.id, url = current.url(), "request aborted by filter");
                    return RequestStage::Aborted;
                }
                Ok(Err(err)) => {
                    tracing::debug!(filter = ?entry.id, error = %err, "request filter failed");
                }
                Err(_) => {
                    tracing::warn!(filter = ?entry.id, "request filter panicked");
                }
            }
        }
        RequestStage::Forward(current)
    }

    /// Run the response filters over a response the transport produced.
    pub async fn filter_response(&self, request: &Request, response: Response) -> Response {
        let entries = self.response_filters.snapshot().into_iter();
        self.filter_from(request, entries, response).await
    }

    /// Each filter gets its own unread view of the current response. With no
    /// response (transport failure) filters are asked for a fallback until
    /// one supplies it; the rest then see that response.
    pub async fn run_response_filters(
        &self,
        request: &Request,
        response: Option<Response>,
    ) -> Option<Response> {
        let mut entries = self.response_filters.snapshot().into_iter();
        let response = match response {
            Some(response) => response,
            None => loop {
                let entry = entries.next()?;
                if let Some(fallback) = self.apply_response_filter(&entry, request, None).await {
                    break fallback;
                }
            },
        };
        Some(self.filter_from(request, entries, response).await)
    }

    async fn filter_from(
        &self,
        request: &Request,
        entries: impl Iterator<Item = FilterEntry<dyn ResponseFilter>>,
        mut response: Response,
    ) -> Response {
        for entry in entries {
            let view = response.try_clone().ok();
            if let Some(next) = self.apply_response_filter(&entry, request, view).await {
                response = next;
            }
        }
        response
    }

    /// One response filter call. Returns the replacement it supplied, if any
    /// usable one. A replacement whose body was already consumed is discarded.
    async fn apply_response_filter(
        &self,
        entry: &FilterEntry<dyn ResponseFilter>,
        request: &Request,
        view: Option<Response>,
    ) -> Option<Response> {
        if !self.response_filters.is_live(entry.id) {
            return None;
        }
        let outcome = AssertUnwindSafe(entry.filter.on_response(request.clone(), view))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(Some(next))) if next.body_used() => {
                tracing::debug!(filter = ?entry.id, "response filter returned a consumed body");
                None
            }
            Ok(Ok(next)) => next,
            Ok(Err(err)) => {
                tracing::debug!(filter = ?entry.id, error = %err, "response filter failed");
                None
            }
            Err(_) => {
                tracing::warn!(filter = ?entry.id, "response filter panicked");
                None
            }
        }
    }

    /// Run one call of the async primitive through the pipeline.
    pub async fn dispatch(
        &self,
        request: Request,
        transport: &dyn AsyncTransport,
    ) -> Result<Response, TransportError> {
        if self.is_bypassed(request.url()) {
            tracing::trace!(url = request.url(), "bypassing interception");
            return transport.fetch(request).await;
        }

        let request = match self.run_request_filters(request).await {
            RequestStage::Forward(request) => request,
            RequestStage::Respond(response) => return Ok(response),
            RequestStage::Aborted => return Err(TransportError::Aborted),
        };

        match transport.fetch(request.clone()).await {
            Ok(response) => Ok(self.filter_response(&request, response).await),
            // Only a hard failure gets a fallback; cancellation and the like pass through.
            Err(err) if !err.is_network() => Err(err),
            Err(err) => {
                tracing::debug!(url = request.url(), error = %err, "transport failed; trying fallback");
                match self.run_response_filters(&request, None).await {
                    Some(response) => {
                        tracing::debug!(url = request.url(), "transport failure absorbed by fallback");
                        Ok(response)
                    }
                    None => Err(err),
                }
            }
        }
    }
}

/// The interposed async primitive.
pub struct InterceptedTransport {
    context: Arc<InterceptionContext>,
    inner: Arc<dyn AsyncTransport>,
    marker: Marker,
}

impl InterceptedTransport {
    pub fn new(context: Arc<InterceptionContext>, inner: Arc<dyn AsyncTransport>, marker: Marker) -> Self {
        Self {
            context,
            inner,
            marker,
        }
    }

    /// The primitive this wrapper calls through to.
    pub fn inner(&self) -> &Arc<dyn AsyncTransport> {
        &self.inner
    }
}

impl Layered for InterceptedTransport {
    fn layer_marker(&self) -> Option<Marker> {
        Some(self.marker)
    }

    fn inner_layer(&self) -> Option<&dyn Layered> {
        Some(&*self.inner)
    }
}

#[async_trait]
impl AsyncTransport for InterceptedTransport {
    async fn fetch(&self, request: Request) -> Result<Response, TransportError> {
        self.context.dispatch(request, &*self.inner).await
    }
}
