//! Radio abstraction for the central role.

use tally_core::{PeerId, SessionToken};

/// Fire-and-forget radio operations the central endpoint issues.
///
/// Commands are stamped with the session token they were issued under; the
/// backend echoes the stamp on every event it produces for that command, so
/// the endpoint can discard callbacks from a defunct session.
pub trait CentralRadio {
    type Error: std::fmt::Debug;

    /// Starts a scan filtered to the given service UUID.
    fn start_scan(&mut self, token: SessionToken, service_uuid: &str) -> Result<(), Self::Error>;

    /// Best-effort stop; no error if already stopped.
    fn stop_scan(&mut self);

    /// Begins a connection attempt to `peer`.
    fn connect(&mut self, token: SessionToken, peer: &PeerId) -> Result<(), Self::Error>;

    /// Enumerates the remote's services and characteristics.
    fn discover_services(&mut self, token: SessionToken, peer: &PeerId)
        -> Result<(), Self::Error>;

    /// Writes a descriptor value on a remote characteristic.
    fn write_descriptor(
        &mut self,
        token: SessionToken,
        peer: &PeerId,
        characteristic: &str,
        descriptor: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error>;

    /// Writes a characteristic value with response.
    fn write_characteristic(
        &mut self,
        token: SessionToken,
        peer: &PeerId,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error>;

    /// Releases the link to `peer`. Best-effort.
    fn disconnect(&mut self, peer: &PeerId);
}

/// One captured radio command, for tests and the loopback harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCommand {
    StartScan {
        token: SessionToken,
        service_uuid: String,
    },
    StopScan,
    Connect {
        token: SessionToken,
        peer: PeerId,
    },
    DiscoverServices {
        token: SessionToken,
        peer: PeerId,
    },
    WriteDescriptor {
        token: SessionToken,
        peer: PeerId,
        characteristic: String,
        descriptor: String,
        payload: Vec<u8>,
    },
    WriteCharacteristic {
        token: SessionToken,
        peer: PeerId,
        characteristic: String,
        payload: Vec<u8>,
    },
    Disconnect {
        peer: PeerId,
    },
}

/// In-memory radio capturing every command in issue order.
#[derive(Debug, Default)]
pub struct MockCentralRadio {
    commands: Vec<CentralCommand>,
    fail_connect: bool,
    fail_scan: bool,
}

impl MockCentralRadio {
    /// Makes `connect` fail, simulating an unreachable peer.
    pub fn fail_connect(&mut self) {
        self.fail_connect = true;
    }

    /// Makes `start_scan` fail, simulating an adapter that went away.
    pub fn fail_scan(&mut self) {
        self.fail_scan = true;
    }

    /// Drains and returns all captured commands.
    pub fn take_commands(&mut self) -> Vec<CentralCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl CentralRadio for MockCentralRadio {
    type Error = &'static str;

    fn start_scan(&mut self, token: SessionToken, service_uuid: &str) -> Result<(), Self::Error> {
        if self.fail_scan {
            return Err("scanner unavailable");
        }
        self.commands.push(CentralCommand::StartScan {
            token,
            service_uuid: service_uuid.to_string(),
        });
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.commands.push(CentralCommand::StopScan);
    }

    fn connect(&mut self, token: SessionToken, peer: &PeerId) -> Result<(), Self::Error> {
        if self.fail_connect {
            return Err("peer unreachable");
        }
        self.commands.push(CentralCommand::Connect {
            token,
            peer: peer.clone(),
        });
        Ok(())
    }

    fn discover_services(
        &mut self,
        token: SessionToken,
        peer: &PeerId,
    ) -> Result<(), Self::Error> {
        self.commands.push(CentralCommand::DiscoverServices {
            token,
            peer: peer.clone(),
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        token: SessionToken,
        peer: &PeerId,
        characteristic: &str,
        descriptor: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error> {
        self.commands.push(CentralCommand::WriteDescriptor {
            token,
            peer: peer.clone(),
            characteristic: characteristic.to_string(),
            descriptor: descriptor.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        token: SessionToken,
        peer: &PeerId,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error> {
        self.commands.push(CentralCommand::WriteCharacteristic {
            token,
            peer: peer.clone(),
            characteristic: characteristic.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn disconnect(&mut self, peer: &PeerId) {
        self.commands.push(CentralCommand::Disconnect { peer: peer.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_records_commands_in_issue_order() {
        let mut radio = MockCentralRadio::default();
        let peer = PeerId::new("aa:bb");
        let token = SessionToken(1);

        radio.start_scan(token, "180d").expect("scan should start");
        radio.stop_scan();
        radio.connect(token, &peer).expect("connect should queue");

        let commands = radio.take_commands();
        assert_eq!(commands.len(), 3);
        assert!(matches!(commands[0], CentralCommand::StartScan { .. }));
        assert_eq!(commands[1], CentralCommand::StopScan);
        assert!(matches!(commands[2], CentralCommand::Connect { .. }));
        assert!(radio.take_commands().is_empty());
    }
}
