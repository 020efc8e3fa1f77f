//! GATT identifiers for the counter service.
//!
//! The service exposes exactly two characteristics: a readable/notifiable
//! counter value and a write-only reset trigger. The client characteristic
//! configuration descriptor hangs off the counter characteristic.

pub const SERVICE_UUID: &str = "0000180d-0000-1000-8000-00805f9b34fb";
pub const COUNTER_CHAR_UUID: &str = "00002a37-0000-1000-8000-00805f9b34fb";
pub const RESET_CHAR_UUID: &str = "00002a39-0000-1000-8000-00805f9b34fb";
pub const CCCD_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

/// Well-known characteristic addressed by a request or notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicId {
    /// 32-bit little-endian counter value; readable and notifiable.
    Counter,
    /// Write-only reset trigger; payload content is not interpreted.
    Reset,
}

/// Resolves a transport-supplied UUID string to a known characteristic.
///
/// UUID strings are matched case-insensitively since platform stacks differ
/// in the casing they report.
pub fn characteristic_from_uuid(uuid: &str) -> Option<CharacteristicId> {
    if uuid.eq_ignore_ascii_case(COUNTER_CHAR_UUID) {
        Some(CharacteristicId::Counter)
    } else if uuid.eq_ignore_ascii_case(RESET_CHAR_UUID) {
        Some(CharacteristicId::Reset)
    } else {
        None
    }
}

/// Whether `uuid` names the subscription (client characteristic
/// configuration) descriptor.
pub fn is_subscription_descriptor(uuid: &str) -> bool {
    uuid.eq_ignore_ascii_case(CCCD_UUID)
}

/// Whether an advertised service list carries the counter service.
pub fn advertises_counter_service(services: &[String]) -> bool {
    services.iter().any(|s| s.eq_ignore_ascii_case(SERVICE_UUID))
}
