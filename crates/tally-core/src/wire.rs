//! Wire encoding for counter values and subscription control payloads.

use crate::error::LinkError;

/// Encoded length of the counter characteristic value.
pub const COUNTER_VALUE_LEN: usize = 4;

/// Subscription descriptor sentinel enabling notifications.
pub const CCCD_ENABLE: [u8; 2] = [0x01, 0x00];
/// Subscription descriptor sentinel disabling notifications.
pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

/// Conventional reset trigger payload. Any non-empty write counts as a
/// reset; this is what the central sends.
pub const RESET_TRIGGER: [u8; 1] = [0x01];

/// Encodes a counter value as 4 little-endian bytes.
pub fn encode_counter(value: u32) -> [u8; COUNTER_VALUE_LEN] {
    value.to_le_bytes()
}

/// Decodes a counter characteristic payload.
///
/// Trailing bytes beyond the fixed width are tolerated; payloads shorter
/// than 4 bytes are rejected.
pub fn decode_counter(bytes: &[u8]) -> Result<u32, LinkError> {
    if bytes.len() < COUNTER_VALUE_LEN {
        return Err(LinkError::Decode("counter payload shorter than 4 bytes"));
    }
    let mut fixed = [0u8; COUNTER_VALUE_LEN];
    fixed.copy_from_slice(&bytes[..COUNTER_VALUE_LEN]);
    Ok(u32::from_le_bytes(fixed))
}

/// Parsed intent of a subscription descriptor write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionSwitch {
    Enable,
    Disable,
}

/// Parses a subscription descriptor payload against the 2-byte sentinels.
///
/// Anything other than the two sentinels is neither enable nor disable and
/// leaves the peer's subscription state untouched.
pub fn parse_subscription_switch(payload: &[u8]) -> Option<SubscriptionSwitch> {
    if payload == CCCD_ENABLE {
        Some(SubscriptionSwitch::Enable)
    } else if payload == CCCD_DISABLE {
        Some(SubscriptionSwitch::Disable)
    } else {
        None
    }
}
