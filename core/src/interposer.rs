//! Installable interceptors for host-provided primitives.
//!
//! # Design
//! A host exposes each transport primitive through a [`Slot`]: a reassignable
//! cell holding an `Arc<T>` (usually a trait object). Installing an
//! [`Interposer`] replaces the slot's value with a wrapper built by the
//! interposer's wrap function, which decides whether and how to call through
//! to the original.
//!
//! Every wrapper reports the interposer's [`Marker`] through [`Layered`].
//! Before wrapping, the interposer walks the value's `inner_layer` chain (the
//! indirection other instrumentation wrappers expose) and leaves the value
//! alone if it already carries the marker, so layers never compound.
//!
//! Slots move through `Uninstalled -> Fixed -> AutoRewrap`. In `AutoRewrap`
//! every later [`Slot::assign`] is wrapped too, so code that reassigns the
//! primitive cannot silently drop interception. There is no way back out of
//! `AutoRewrap`.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity shared by every wrapper one interposer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Marker(Uuid);

impl Marker {
    pub fn new() -> Self {
        Marker(Uuid::new_v4())
    }
}

impl Default for Marker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Implemented by every host primitive so wrappers can be recognized.
///
/// Plain primitives keep the defaults. Wrappers report their marker and,
/// when they delegate to another layered value, expose it as `inner_layer`.
pub trait Layered: Send + Sync {
    fn layer_marker(&self) -> Option<Marker> {
        None
    }

    fn inner_layer(&self) -> Option<&dyn Layered> {
        None
    }
}

/// Bound on how many `inner_layer` links are followed.
const MAX_LAYER_DEPTH: usize = 32;

/// True if `value`, or any layer it transitively wraps, carries `marker`.
pub fn is_marked<T: ?Sized + Layered>(value: &T, marker: Marker) -> bool {
    if value.layer_marker() == Some(marker) {
        return true;
    }
    let mut next = value.inner_layer();
    let mut depth = 0;
    while let Some(layer) = next {
        if layer.layer_marker() == Some(marker) {
            return true;
        }
        depth += 1;
        if depth >= MAX_LAYER_DEPTH {
            break;
        }
        next = layer.inner_layer();
    }
    false
}

type WrapFn<T> = dyn Fn(Marker, Arc<T>) -> Arc<T> + Send + Sync;

/// Wraps values of type `T` and recognizes its own wrappers.
pub struct Interposer<T: ?Sized> {
    marker: Marker,
    wrap: Arc<WrapFn<T>>,
}

impl<T: ?Sized> Clone for Interposer<T> {
    fn clone(&self) -> Self {
        Self {
            marker: self.marker,
            wrap: Arc::clone(&self.wrap),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Interposer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interposer")
            .field("marker", &self.marker)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized + Layered + 'static> Interposer<T> {
    /// `wrap` receives the interposer's marker and the target, and returns
    /// the wrapper. The wrapper must report the marker via `layer_marker`.
    pub fn new<F>(wrap: F) -> Self
    where
        F: Fn(Marker, Arc<T>) -> Arc<T> + Send + Sync + 'static,
    {
        Self::with_marker(Marker::new(), wrap)
    }

    pub fn with_marker<F>(marker: Marker, wrap: F) -> Self
    where
        F: Fn(Marker, Arc<T>) -> Arc<T> + Send + Sync + 'static,
    {
        Self {
            marker,
            wrap: Arc::new(wrap),
        }
    }

    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// Wrap `target`, or return it unchanged if it is already wrapped by this
    /// interposer.
    pub fn wrap(&self, target: Arc<T>) -> Arc<T> {
        if is_marked(&*target, self.marker) {
            tracing::trace!(marker = %self.marker, "value already interposed");
            return target;
        }
        let wrapped = (self.wrap)(self.marker, target);
        if wrapped.layer_marker() != Some(self.marker) {
            tracing::warn!(marker = %self.marker, "wrapper does not report its marker");
        }
        wrapped
    }
}

/// How a slot is interposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Replace the current value once.
    Fixed,
    /// Replace the current value and every later assignment.
    #[default]
    AutoRewrap,
}

/// Installation state of a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Installation {
    #[default]
    Uninstalled,
    Fixed,
    AutoRewrap,
}

struct SlotState<T: ?Sized> {
    current: Option<Arc<T>>,
    installation: Installation,
    rewrap: Option<Interposer<T>>,
}

/// A reassignable cell holding a host primitive.
pub struct Slot<T: ?Sized> {
    state: RwLock<SlotState<T>>,
}

impl<T: ?Sized> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Slot")
            .field("bound", &state.current.is_some())
            .field("installation", &state.installation)
            .finish()
    }
}

impl<T: ?Sized + Layered + 'static> Slot<T> {
    /// A slot nothing has been assigned to yet.
    pub fn vacant() -> Self {
        Self {
            state: RwLock::new(SlotState {
                current: None,
                installation: Installation::Uninstalled,
                rewrap: None,
            }),
        }
    }

    pub fn new(value: Arc<T>) -> Self {
        let slot = Self::vacant();
        slot.state.write().current = Some(value);
        slot
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.state.read().current.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.state.read().current.is_some()
    }

    pub fn installation(&self) -> Installation {
        self.state.read().installation
    }

    /// Store a new value. Under `AutoRewrap` the value is wrapped first.
    pub fn assign(&self, value: Arc<T>) {
        let mut state = self.state.write();
        let value = match &state.rewrap {
            Some(interposer) => interposer.wrap(value),
            None => value,
        };
        state.current = Some(value);
    }

    /// Interpose this slot and return the resulting installation state.
    ///
    /// A vacant slot installed as `Fixed` stays vacant and is not wrapped when
    /// later assigned; callers that cannot guarantee a bound slot should use
    /// `AutoRewrap` or wait for the binding first.
    pub fn install(&self, interposer: &Interposer<T>, mode: InstallMode) -> Installation {
        let mut state = self.state.write();
        if state.installation == Installation::AutoRewrap {
            return Installation::AutoRewrap;
        }
        if let Some(current) = state.current.take() {
            state.current = Some(interposer.wrap(current));
        }
        state.installation = match mode {
            InstallMode::Fixed => Installation::Fixed,
            InstallMode::AutoRewrap => {
                state.rewrap = Some(interposer.clone());
                Installation::AutoRewrap
            }
        };
        state.installation
    }
}
