//! Filter traits and the ordered registries that hold them.
//!
//! # Design
//! A registry is an ordered set keyed by `Arc` identity: registering the same
//! filter twice keeps the original entry, so no filter runs twice for one
//! event. Order is registration order and nothing else; a consumer that must
//! run first has to register first.
//!
//! Pipelines iterate over a [`FilterRegistry::snapshot`] taken when they
//! start and check [`FilterRegistry::is_live`] before each call. Filters
//! registered mid-flight are not picked up, and unregistering takes effect
//! for entries not yet visited.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::http::{Request, Response};

/// What a request filter wants done with the request.
#[derive(Debug)]
pub enum RequestAction {
    /// Leave the request as it is.
    Continue,
    /// Use this request for the remaining filters and the transport.
    Replace(Request),
    /// Short-circuit: this is the response, skip the network.
    Respond(Response),
    /// Fail the call as aborted.
    Abort,
}

/// Inspects or transforms outgoing requests.
///
/// Returning `Err` (or panicking) is a filter fault: the pipeline discards it
/// and carries on with the request it had before this filter ran.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    async fn on_request(&self, request: Request) -> anyhow::Result<RequestAction>;
}

#[async_trait]
impl<F, Fut> RequestFilter for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<RequestAction>> + Send,
{
    async fn on_request(&self, request: Request) -> anyhow::Result<RequestAction> {
        (self)(request).await
    }
}

/// Inspects or replaces responses.
///
/// `response` is `None` when the transport failed; returning `Some` then
/// synthesizes a fallback. Returning `Ok(None)` keeps the current response.
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    async fn on_response(
        &self,
        request: Request,
        response: Option<Response>,
    ) -> anyhow::Result<Option<Response>>;
}

#[async_trait]
impl<F, Fut> ResponseFilter for F
where
    F: Fn(Request, Option<Response>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Response>>> + Send,
{
    async fn on_response(
        &self,
        request: Request,
        response: Option<Response>,
    ) -> anyhow::Result<Option<Response>> {
        (self)(request, response).await
    }
}

/// Identifier of a registry entry. Ids grow with registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterId(u64);

/// A registered filter together with its position.
pub struct FilterEntry<F: ?Sized> {
    pub id: FilterId,
    pub filter: Arc<F>,
}

impl<F: ?Sized> Clone for FilterEntry<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            filter: Arc::clone(&self.filter),
        }
    }
}

struct RegistryInner<F: ?Sized> {
    entries: Mutex<Vec<FilterEntry<F>>>,
    next_id: AtomicU64,
}

trait Deregister: Send + Sync {
    fn deregister(&self, id: FilterId) -> bool;
    fn contains(&self, id: FilterId) -> bool;
}

impl<F: ?Sized + Send + Sync> Deregister for RegistryInner<F> {
    fn deregister(&self, id: FilterId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    fn contains(&self, id: FilterId) -> bool {
        self.entries.lock().iter().any(|e| e.id == id)
    }
}

/// Ordered identity set of filters.
pub struct FilterRegistry<F: ?Sized> {
    inner: Arc<RegistryInner<F>>,
}

impl<F: ?Sized> fmt::Debug for FilterRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("len", &self.inner.entries.lock().len())
            .finish()
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for FilterRegistry<F> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> FilterRegistry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `filter` and return its disposer. A filter that is already
    /// registered keeps its position and the returned disposer removes it.
    pub fn register(&self, filter: Arc<F>) -> Registration {
        let mut entries = self.inner.entries.lock();
        let id = match entries.iter().find(|e| same_filter(&e.filter, &filter)) {
            Some(existing) => existing.id,
            None => {
                let id = FilterId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
                entries.push(FilterEntry { id, filter });
                id
            }
        };
        let inner: Arc<dyn Deregister> = self.inner.clone();
        Registration {
            id,
            registry: Arc::downgrade(&inner),
        }
    }

    /// Entries in registration order, as of now.
    pub fn snapshot(&self) -> Vec<FilterEntry<F>> {
        self.inner.entries.lock().clone()
    }

    pub fn is_live(&self, id: FilterId) -> bool {
        self.inner.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

fn same_filter<F: ?Sized>(a: &Arc<F>, b: &Arc<F>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Disposer returned by `register`. Dropping it does not unregister.
#[derive(Clone)]
#[must_use = "keep the registration to be able to unregister the filter"]
pub struct Registration {
    id: FilterId,
    registry: Weak<dyn Deregister>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Registration {
    pub fn id(&self) -> FilterId {
        self.id
    }

    /// Remove exactly this entry. Returns false if it was already gone.
    pub fn unregister(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.deregister(self.id),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.contains(self.id))
    }
}
