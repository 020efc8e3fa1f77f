//! Core tally-link primitives shared across crates.
//!
//! Includes identifier types, the GATT service/characteristic registry, the
//! counter wire codec, and the shared error type.

pub mod error;
pub mod types;
pub mod uuids;
pub mod wire;

pub use error::LinkError;
pub use types::{PeerId, RequestId, ResponseStatus, SessionToken};
pub use uuids::{
    characteristic_from_uuid, CharacteristicId, CCCD_UUID, COUNTER_CHAR_UUID, RESET_CHAR_UUID,
    SERVICE_UUID,
};
