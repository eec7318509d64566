//! Vocabulary of the stateful, event-driven transport.
//!
//! # Design
//! The numeric values of `ReadyState` match the legacy object's readiness
//! field so hosts can map them one to one. `XhrBody` is the materialized
//! result the caller asked for through `ResponseType`; the adapter builds it
//! from a canonical response once the filter pipeline has settled.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Readiness of a stateful transport object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ReadyState {
    #[default]
    Unsent = 0,
    Opened = 1,
    HeadersReceived = 2,
    Loading = 3,
    Done = 4,
}

impl ReadyState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Result shape the caller expects from a stateful transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Text,
    Json,
    ArrayBuffer,
    Blob,
    /// Parsed-document results are never rewritten by the adapter.
    Document,
}

/// A materialized response body.
#[derive(Debug, Clone, PartialEq)]
pub enum XhrBody {
    Text(String),
    Json(serde_json::Value),
    ArrayBuffer(Bytes),
    Blob { content_type: String, data: Bytes },
    Document(String),
}

impl XhrBody {
    /// Raw bytes behind any shape. JSON is re-serialized.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            XhrBody::Text(text) | XhrBody::Document(text) => {
                Bytes::copy_from_slice(text.as_bytes())
            }
            XhrBody::Json(value) => Bytes::from(value.to_string()),
            XhrBody::ArrayBuffer(data) | XhrBody::Blob { data, .. } => data.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XhrEventKind {
    ReadyStateChange,
    LoadStart,
    Progress,
    Load,
    Error,
    Abort,
    Timeout,
    LoadEnd,
}

/// An event fired by a stateful transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XhrEvent {
    pub kind: XhrEventKind,
    pub ready_state: ReadyState,
}

impl XhrEvent {
    pub fn new(kind: XhrEventKind, ready_state: ReadyState) -> Self {
        Self { kind, ready_state }
    }

    pub fn ready_state_change(ready_state: ReadyState) -> Self {
        Self::new(XhrEventKind::ReadyStateChange, ready_state)
    }

    /// Completion signals plus the readiness change into `Done`.
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            XhrEventKind::ReadyStateChange => self.ready_state == ReadyState::Done,
            XhrEventKind::LoadStart | XhrEventKind::Progress => false,
            XhrEventKind::Load
            | XhrEventKind::Error
            | XhrEventKind::Abort
            | XhrEventKind::Timeout
            | XhrEventKind::LoadEnd => true,
        }
    }
}

/// Listener attached to a stateful transport.
pub type EventListener = Box<dyn FnMut(&XhrEvent) + Send>;
