//! Central endpoint of the counter link.
//!
//! Scans for the counter service, connects to the first match, discovers the
//! two characteristics, subscribes for change notifications, and relays
//! reset writes. The platform radio sits behind [`CentralRadio`]; an
//! in-memory mock keeps the endpoint testable without hardware. Enable the
//! `btleplug` feature for the experimental hardware backend.

pub mod endpoint;
pub mod radio;

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;

pub use endpoint::{Central, CentralConfig, CentralEvent, CentralStats};
pub use radio::{CentralCommand, CentralRadio, MockCentralRadio};
