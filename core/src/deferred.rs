//! Deferred binding: wait for a named value to be assigned.
//!
//! # Design
//! [`Bindings`] is a keyed property table whose values are published late by
//! other code. `on_set` hands out a single-resolution future backed by a
//! `futures` oneshot channel: it resolves with the first value assigned after
//! the call, or right away with the present value in [`OnSetMode::Current`].
//! Later assignments never re-resolve it.
//!
//! There is no timeout. If nothing is ever assigned the future stays pending,
//! including after the table itself is dropped; callers that need a deadline
//! race it externally.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{join_all, FutureExt};
use parking_lot::Mutex;

/// When an `on_set` future may resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnSetMode {
    /// Resolve immediately if a value is already present.
    #[default]
    Current,
    /// Only resolve on the next assignment.
    Next,
}

struct Entry<V> {
    value: Option<V>,
    waiters: Vec<oneshot::Sender<V>>,
}

impl<V> Default for Entry<V> {
    fn default() -> Self {
        Self {
            value: None,
            waiters: Vec::new(),
        }
    }
}

/// A table of late-bound named values.
pub struct Bindings<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> Default for Bindings<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> fmt::Debug for Bindings<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        f.debug_struct("Bindings").field("keys", &keys).finish()
    }
}

impl<V: Clone + Send + 'static> Bindings<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key` and resolve everything waiting on it.
    pub fn assign(&self, key: &str, value: V) {
        let waiters = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_default();
            entry.value = Some(value.clone());
            std::mem::take(&mut entry.waiters)
        };
        for waiter in waiters {
            // A dropped receiver just means nobody is waiting anymore.
            let _ = waiter.send(value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().get(key).and_then(|e| e.value.clone())
    }

    pub fn on_set(&self, key: &str, mode: OnSetMode) -> OnSet<V> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_default();
        if mode == OnSetMode::Current {
            if let Some(value) = &entry.value {
                return OnSet {
                    state: OnSetState::Ready(Some(value.clone())),
                };
            }
        }
        entry.waiters.retain(|waiter| !waiter.is_canceled());
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        OnSet {
            state: OnSetState::Waiting(rx),
        }
    }

    /// Resolve once every key has fired, yielding all captured values.
    pub fn multi_on_set(
        &self,
        keys: &[&str],
        mode: OnSetMode,
    ) -> impl Future<Output = HashMap<String, V>> + Send + 'static {
        let pending: Vec<_> = keys
            .iter()
            .map(|key| {
                let name = key.to_string();
                self.on_set(key, mode).map(move |value| (name, value))
            })
            .collect();
        join_all(pending).map(|pairs| pairs.into_iter().collect())
    }
}

enum OnSetState<V> {
    Ready(Option<V>),
    Waiting(oneshot::Receiver<V>),
    Forever,
}

/// Future returned by [`Bindings::on_set`].
pub struct OnSet<V> {
    state: OnSetState<V>,
}

impl<V> OnSet<V> {
    /// True once the value is available without waiting.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, OnSetState::Ready(Some(_)))
    }
}

impl<V> Unpin for OnSet<V> {}

impl<V> Future for OnSet<V> {
    type Output = V;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<V> {
        let this = self.get_mut();
        match &mut this.state {
            OnSetState::Ready(value) => match value.take() {
                Some(value) => Poll::Ready(value),
                None => Poll::Pending,
            },
            OnSetState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(value)) => Poll::Ready(value),
                Poll::Ready(Err(oneshot::Canceled)) => {
                    this.state = OnSetState::Forever;
                    Poll::Pending
                }
                Poll::Pending => Poll::Pending,
            },
            OnSetState::Forever => Poll::Pending,
        }
    }
}
