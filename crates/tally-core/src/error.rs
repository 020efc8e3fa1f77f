use thiserror::Error;

/// Shared error type for counter-link operations.
///
/// Per-peer failures are reported through these variants and stay isolated;
/// only `CapabilityUnavailable` at startup is a hard failure for the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Radio is off or a required authorization grant is missing.
    /// Non-retryable until the external condition changes.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(&'static str),
    /// Discovered peer lacks the expected service or characteristics.
    #[error("service mismatch: {0}")]
    ServiceMismatch(&'static str),
    /// Transport-level disconnect. Cleans up local state, never fatal.
    #[error("connection lost")]
    ConnectionLost,
    /// No response to a pending request within the bounded window.
    #[error("request timed out")]
    RequestTimeout,
    /// Malformed or unexpected characteristic addressed.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// Payload failed to parse as a counter-link value.
    #[error("decode error: {0}")]
    Decode(&'static str),
}
