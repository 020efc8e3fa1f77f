//! Radio abstraction for the peripheral role.

use std::collections::HashSet;

use tally_core::{PeerId, RequestId, ResponseStatus};

/// Fire-and-forget radio operations the peripheral endpoint issues.
///
/// All calls are non-blocking; connection changes and inbound requests come
/// back later as [`crate::endpoint::PeripheralEvent`]s.
pub trait PeripheralRadio {
    type Error: std::fmt::Debug;

    /// Begins broadcasting the service UUID plus a human-readable name, at
    /// the highest duty cycle available, with no timeout.
    fn start_advertising(&mut self, service_uuid: &str, local_name: &str)
        -> Result<(), Self::Error>;

    /// Best-effort stop; no error if already stopped.
    fn stop_advertising(&mut self);

    /// Answers one read/write request. Called exactly once per request.
    fn send_response(
        &mut self,
        peer: &PeerId,
        request: RequestId,
        status: ResponseStatus,
        value: &[u8],
    ) -> Result<(), Self::Error>;

    /// Pushes a changed characteristic value to one subscribed peer.
    fn notify(&mut self, peer: &PeerId, value: &[u8]) -> Result<(), Self::Error>;
}

/// In-memory radio capturing outbound traffic, for tests and the loopback
/// harness.
#[derive(Debug, Default)]
pub struct MockPeripheralRadio {
    advertising: Option<(String, String)>,
    responses: Vec<(PeerId, RequestId, ResponseStatus, Vec<u8>)>,
    notifications: Vec<(PeerId, Vec<u8>)>,
    fail_notify: HashSet<PeerId>,
    fail_advertising: bool,
}

impl MockPeripheralRadio {
    /// Radio that rejects `start_advertising`, simulating a missing
    /// platform advertiser.
    pub fn without_advertiser() -> Self {
        Self {
            fail_advertising: true,
            ..Self::default()
        }
    }

    /// Makes every `notify` to `peer` fail, simulating a peer that vanished
    /// mid-fan-out.
    pub fn fail_notify_for(&mut self, peer: PeerId) {
        self.fail_notify.insert(peer);
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.is_some()
    }

    /// Advertised (service UUID, local name) pair, if advertising.
    pub fn advertised(&self) -> Option<&(String, String)> {
        self.advertising.as_ref()
    }

    /// Drains and returns all captured responses.
    pub fn take_responses(&mut self) -> Vec<(PeerId, RequestId, ResponseStatus, Vec<u8>)> {
        std::mem::take(&mut self.responses)
    }

    /// Drains and returns all captured notifications.
    pub fn take_notifications(&mut self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut self.notifications)
    }
}

impl PeripheralRadio for MockPeripheralRadio {
    type Error = &'static str;

    fn start_advertising(
        &mut self,
        service_uuid: &str,
        local_name: &str,
    ) -> Result<(), Self::Error> {
        if self.fail_advertising {
            return Err("advertiser unavailable");
        }
        self.advertising = Some((service_uuid.to_string(), local_name.to_string()));
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.advertising = None;
    }

    fn send_response(
        &mut self,
        peer: &PeerId,
        request: RequestId,
        status: ResponseStatus,
        value: &[u8],
    ) -> Result<(), Self::Error> {
        self.responses
            .push((peer.clone(), request, status, value.to_vec()));
        Ok(())
    }

    fn notify(&mut self, peer: &PeerId, value: &[u8]) -> Result<(), Self::Error> {
        if self.fail_notify.contains(peer) {
            return Err("peer unreachable");
        }
        self.notifications.push((peer.clone(), value.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_captures_and_drains_outbound_traffic() {
        let mut radio = MockPeripheralRadio::default();
        let peer = PeerId::new("aa:bb");

        radio
            .start_advertising("1234", "tally")
            .expect("advertising should start");
        assert!(radio.is_advertising());

        radio
            .notify(&peer, &[1, 0, 0, 0])
            .expect("notify should succeed");
        assert_eq!(radio.take_notifications().len(), 1);
        assert!(radio.take_notifications().is_empty());

        radio.stop_advertising();
        assert!(!radio.is_advertising());
    }

    #[test]
    fn injected_notify_failure_only_hits_that_peer() {
        let mut radio = MockPeripheralRadio::default();
        let down = PeerId::new("down");
        let up = PeerId::new("up");
        radio.fail_notify_for(down.clone());

        assert!(radio.notify(&down, &[0; 4]).is_err());
        assert!(radio.notify(&up, &[0; 4]).is_ok());
    }
}
