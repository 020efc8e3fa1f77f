//! Session-layer logic shared by both counter-link roles.
//!
//! Models the connection lifecycle as an explicit event-driven state machine,
//! gates radio operations behind a capability collaborator, and tracks
//! pending request/response exchanges so every request is answered exactly
//! once.

pub mod gate;
pub mod machine;
pub mod pending;
pub mod sink;

pub use gate::{require_start, Capability, CapabilityGate, FixedGate};
pub use machine::{Role, Session, SessionEvent, SessionPhase, SessionStep};
pub use pending::PendingLedger;
pub use sink::{NullSink, RecordingSink, StatusSink};
