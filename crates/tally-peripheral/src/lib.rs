//! Peripheral endpoint of the counter link.
//!
//! Owns the authoritative counter value, exposes it as a discoverable
//! service, serves reads, accepts reset writes, and fans notifications out
//! to every subscribed peer. The platform radio sits behind
//! [`PeripheralRadio`]; an in-memory mock keeps the whole endpoint testable
//! without hardware.

pub mod endpoint;
pub mod radio;

pub use endpoint::{Peripheral, PeripheralConfig, PeripheralEvent, PeripheralStats};
pub use radio::{MockPeripheralRadio, PeripheralRadio};
