//! Capability gating for radio operations.
//!
//! Platform authorization state lives behind one collaborator queried per
//! lifecycle transition, keeping the datapath free of platform branching.
//! A missing grant means no radio operation is attempted at all.

use tally_core::LinkError;

use crate::machine::Role;

/// Authorization grants the platform may withhold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Scan,
    Connect,
    Advertise,
    /// Coarse/fine location; only consulted on legacy platform generations
    /// where scanning rides on the location grant.
    Location,
}

/// Platform-authorization collaborator.
pub trait CapabilityGate {
    /// Whether the radio itself is powered and usable.
    fn radio_enabled(&self) -> bool;

    /// Whether the given authorization grant is currently held.
    fn granted(&self, capability: Capability) -> bool;

    /// Whether this platform generation still requires the location grant
    /// for scanning.
    fn requires_location(&self) -> bool {
        false
    }
}

/// Checks the prerequisite set for starting an endpoint in `role`.
///
/// Queried once per lifecycle transition; the error names the first missing
/// prerequisite so the host can surface it.
pub fn require_start(gate: &dyn CapabilityGate, role: Role) -> Result<(), LinkError> {
    if !gate.radio_enabled() {
        return Err(LinkError::CapabilityUnavailable("radio disabled"));
    }
    match role {
        Role::Peripheral => {
            if !gate.granted(Capability::Advertise) {
                return Err(LinkError::CapabilityUnavailable("advertise grant missing"));
            }
            if !gate.granted(Capability::Connect) {
                return Err(LinkError::CapabilityUnavailable("connect grant missing"));
            }
        }
        Role::Central => {
            if !gate.granted(Capability::Scan) {
                return Err(LinkError::CapabilityUnavailable("scan grant missing"));
            }
            if !gate.granted(Capability::Connect) {
                return Err(LinkError::CapabilityUnavailable("connect grant missing"));
            }
            if gate.requires_location() && !gate.granted(Capability::Location) {
                return Err(LinkError::CapabilityUnavailable("location grant missing"));
            }
        }
    }
    Ok(())
}

/// Gate with fixed answers, for tests and headless deployments.
#[derive(Debug, Clone)]
pub struct FixedGate {
    pub radio: bool,
    pub scan: bool,
    pub connect: bool,
    pub advertise: bool,
    pub location: bool,
    pub legacy_location: bool,
}

impl Default for FixedGate {
    fn default() -> Self {
        Self {
            radio: true,
            scan: true,
            connect: true,
            advertise: true,
            location: true,
            legacy_location: false,
        }
    }
}

impl FixedGate {
    /// Gate with everything granted.
    pub fn all_granted() -> Self {
        Self::default()
    }

    /// Gate reporting the radio as powered off.
    pub fn radio_off() -> Self {
        Self {
            radio: false,
            ..Self::default()
        }
    }
}

impl CapabilityGate for FixedGate {
    fn radio_enabled(&self) -> bool {
        self.radio
    }

    fn granted(&self, capability: Capability) -> bool {
        match capability {
            Capability::Scan => self.scan,
            Capability::Connect => self.connect,
            Capability::Advertise => self.advertise,
            Capability::Location => self.location,
        }
    }

    fn requires_location(&self) -> bool {
        self.legacy_location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_granted_passes_both_roles() {
        let gate = FixedGate::all_granted();
        assert!(require_start(&gate, Role::Peripheral).is_ok());
        assert!(require_start(&gate, Role::Central).is_ok());
    }

    #[test]
    fn radio_off_blocks_everything() {
        let gate = FixedGate::radio_off();
        assert_eq!(
            require_start(&gate, Role::Peripheral),
            Err(LinkError::CapabilityUnavailable("radio disabled"))
        );
        assert_eq!(
            require_start(&gate, Role::Central),
            Err(LinkError::CapabilityUnavailable("radio disabled"))
        );
    }

    #[test]
    fn missing_advertise_grant_blocks_peripheral_only() {
        let gate = FixedGate {
            advertise: false,
            ..FixedGate::default()
        };
        assert_eq!(
            require_start(&gate, Role::Peripheral),
            Err(LinkError::CapabilityUnavailable("advertise grant missing"))
        );
        assert!(require_start(&gate, Role::Central).is_ok());
    }

    #[test]
    fn location_is_checked_only_on_legacy_platforms() {
        let modern = FixedGate {
            location: false,
            ..FixedGate::default()
        };
        assert!(require_start(&modern, Role::Central).is_ok());

        let legacy = FixedGate {
            location: false,
            legacy_location: true,
            ..FixedGate::default()
        };
        assert_eq!(
            require_start(&legacy, Role::Central),
            Err(LinkError::CapabilityUnavailable("location grant missing"))
        );
    }
}
