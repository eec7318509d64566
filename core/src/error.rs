//! Error types surfaced by both transport primitives.
//!
//! # Design
//! Callers of an intercepted transport must only ever see the outcomes the
//! primitive already defines, so there is a single error enum shared by the
//! async transport, the stateful transport and the canonical values. Faults
//! raised by filters are `anyhow::Error` and never reach this type; the
//! pipeline swallows them.

/// Errors returned by transports and by canonical request/response values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Hard transport failure: the request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// A request filter returned the abort signal.
    #[error("the request was aborted")]
    Aborted,

    /// A stateful transport call arrived out of order.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The body of this response view has already been consumed.
    #[error("body has already been read")]
    BodyAlreadyRead,

    /// A body could not be decoded into the requested shape.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A header name or value was rejected.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

impl TransportError {
    /// True for failures that mean "no response exists", which is what makes
    /// the response filters run their fallback pass.
    pub fn is_network(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}
