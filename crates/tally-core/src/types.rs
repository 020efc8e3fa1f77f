use serde::{Deserialize, Serialize};

/// Opaque link-layer address of a remote party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one connection attempt.
///
/// Every radio event carries the token of the session it was issued under;
/// events bearing a token from a defunct session are discarded instead of
/// mutating state for a connection that no longer exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub u64);

/// Transport-supplied correlation identifier for one read/write exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u32);

/// Outcome status carried on a read/write response.
///
/// Every request that expects a response gets exactly one of these; a request
/// is never left unanswered, or the remote stack stalls waiting for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    /// Addressed characteristic or descriptor is not part of the service.
    NotSupported,
    /// Read offset lies past the end of the value.
    InvalidOffset,
}
