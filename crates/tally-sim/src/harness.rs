//! Loopback harness wiring the two endpoints together.
//!
//! Commands drained from the central's mock radio become transport events on
//! the peripheral, and the peripheral's captured responses and notifications
//! become events on the central. Each call to [`LinkHarness::pump`] routes
//! until both sides are quiescent, so a test can interleave local actions
//! with deliveries at well-defined points.

use std::collections::HashMap;

use tally_central::{Central, CentralCommand, CentralConfig, CentralEvent, MockCentralRadio};
use tally_core::{PeerId, RequestId, ResponseStatus, SessionToken};
use tally_peripheral::{MockPeripheralRadio, Peripheral, PeripheralConfig, PeripheralEvent};
use tally_session::{CapabilityGate, FixedGate, RecordingSink};

/// Which central command an in-flight peripheral request came from, so the
/// eventual response routes back as the matching completion event.
#[derive(Debug, Clone)]
enum OutboundWrite {
    Descriptor {
        token: SessionToken,
        characteristic: String,
    },
    Characteristic {
        token: SessionToken,
        characteristic: String,
    },
}

/// One peripheral and one central joined by a lossless in-memory link.
#[derive(Debug)]
pub struct LinkHarness {
    pub peripheral: Peripheral<MockPeripheralRadio, RecordingSink>,
    pub central: Central<MockCentralRadio, RecordingSink>,
    /// Address the central sees the peripheral under.
    pub peripheral_addr: PeerId,
    /// Address the peripheral sees the central under.
    pub central_addr: PeerId,
    step: u64,
    connected: bool,
    link_token: SessionToken,
    next_request: u32,
    in_flight: HashMap<RequestId, OutboundWrite>,
    /// Responses the link silently loses instead of delivering, keyed by the
    /// characteristic the write addressed.
    drop_completions_for: Option<String>,
}

impl LinkHarness {
    pub fn new() -> Self {
        Self::with_central_config(CentralConfig::default())
    }

    pub fn with_central_config(config: CentralConfig) -> Self {
        Self {
            peripheral: Peripheral::new(
                MockPeripheralRadio::default(),
                RecordingSink::default(),
                PeripheralConfig::default(),
            ),
            central: Central::new(MockCentralRadio::default(), RecordingSink::default(), config),
            peripheral_addr: PeerId::new("peripheral:00"),
            central_addr: PeerId::new("central:00"),
            step: 0,
            connected: false,
            link_token: SessionToken::default(),
            next_request: 0,
            in_flight: HashMap::new(),
            drop_completions_for: None,
        }
    }

    pub fn gate() -> FixedGate {
        FixedGate::all_granted()
    }

    pub fn now_step(&self) -> u64 {
        self.step
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Starts both endpoints under a fully-granting gate.
    pub fn start_both(&mut self) {
        let gate = Self::gate();
        self.start_both_gated(&gate);
    }

    pub fn start_both_gated(&mut self, gate: &dyn CapabilityGate) {
        self.peripheral
            .start(gate)
            .expect("peripheral should start");
        self.central.start_scan(gate).expect("central should scan");
    }

    /// Makes the link lose every completion for writes addressing
    /// `characteristic`, leaving those requests to time out.
    pub fn drop_completions_for(&mut self, characteristic: &str) {
        self.drop_completions_for = Some(characteristic.to_string());
    }

    /// Advances abstract time and expires overdue central requests.
    pub fn advance(&mut self, steps: u64) -> usize {
        self.step += steps;
        self.central.pump_timeouts(self.step)
    }

    /// Routes traffic both ways until neither side produces more. Returns
    /// the number of routing rounds it took.
    pub fn pump(&mut self) -> usize {
        let mut rounds = 0;
        loop {
            let mut moved = false;
            moved |= self.route_central_commands();
            moved |= self.route_peripheral_outbound();
            if !moved {
                break;
            }
            rounds += 1;
        }
        rounds
    }

    /// Severs the link from the peripheral's side, as a vanished peer would.
    pub fn drop_link_from_peripheral(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.in_flight.clear();
        self.peripheral.handle_event(
            PeripheralEvent::PeerDisconnected {
                peer: self.central_addr.clone(),
            },
            self.step,
        );
        self.central.handle_event(
            CentralEvent::ConnectionChanged {
                token: self.link_token,
                peer: self.peripheral_addr.clone(),
                connected: false,
            },
            self.step,
        );
    }

    /// Delivers a counter notification stamped with an already-dead token,
    /// as a straggling callback from a torn-down session would be.
    pub fn deliver_stale_notification(&mut self, token: SessionToken, payload: Vec<u8>) {
        self.central.handle_event(
            CentralEvent::Notification {
                token,
                peer: self.peripheral_addr.clone(),
                characteristic: tally_core::COUNTER_CHAR_UUID.to_string(),
                payload,
            },
            self.step,
        );
    }

    fn alloc_request(&mut self) -> RequestId {
        let request = RequestId(self.next_request);
        self.next_request += 1;
        request
    }

    fn route_central_commands(&mut self) -> bool {
        let commands = self.central.radio_mut().take_commands();
        let moved = !commands.is_empty();
        for command in commands {
            self.route_command(command);
        }
        moved
    }

    fn route_command(&mut self, command: CentralCommand) {
        match command {
            CentralCommand::StartScan { token, .. } => {
                // A lossless link delivers the advertisement as soon as the
                // scan starts, provided the peripheral is broadcasting.
                let Some((service, name)) = self.peripheral.radio_mut().advertised().cloned()
                else {
                    return;
                };
                self.central.handle_event(
                    CentralEvent::AdvertisementSeen {
                        token,
                        peer: self.peripheral_addr.clone(),
                        services: vec![service],
                        local_name: Some(name),
                    },
                    self.step,
                );
            }
            CentralCommand::StopScan => {}
            CentralCommand::Connect { token, peer } => {
                self.connected = true;
                self.link_token = token;
                self.peripheral.handle_event(
                    PeripheralEvent::PeerConnected {
                        peer: self.central_addr.clone(),
                    },
                    self.step,
                );
                self.central.handle_event(
                    CentralEvent::ConnectionChanged {
                        token,
                        peer,
                        connected: true,
                    },
                    self.step,
                );
            }
            CentralCommand::DiscoverServices { token, peer } => {
                if !self.connected {
                    return;
                }
                self.central.handle_event(
                    CentralEvent::ServicesDiscovered {
                        token,
                        peer,
                        characteristics: vec![
                            tally_core::COUNTER_CHAR_UUID.to_string(),
                            tally_core::RESET_CHAR_UUID.to_string(),
                        ],
                    },
                    self.step,
                );
            }
            CentralCommand::WriteDescriptor {
                token,
                characteristic,
                descriptor,
                payload,
                ..
            } => {
                if !self.connected {
                    return;
                }
                let request = self.alloc_request();
                self.in_flight.insert(
                    request,
                    OutboundWrite::Descriptor {
                        token,
                        characteristic,
                    },
                );
                self.peripheral.handle_event(
                    PeripheralEvent::DescriptorWrite {
                        peer: self.central_addr.clone(),
                        request,
                        descriptor,
                        payload,
                        response_required: true,
                    },
                    self.step,
                );
            }
            CentralCommand::WriteCharacteristic {
                token,
                characteristic,
                payload,
                ..
            } => {
                if !self.connected {
                    return;
                }
                let request = self.alloc_request();
                self.in_flight.insert(
                    request,
                    OutboundWrite::Characteristic {
                        token,
                        characteristic: characteristic.clone(),
                    },
                );
                self.peripheral.handle_event(
                    PeripheralEvent::WriteRequest {
                        peer: self.central_addr.clone(),
                        request,
                        characteristic,
                        payload,
                        response_required: true,
                    },
                    self.step,
                );
            }
            CentralCommand::Disconnect { .. } => {
                if !self.connected {
                    return;
                }
                self.connected = false;
                self.in_flight.clear();
                self.peripheral.handle_event(
                    PeripheralEvent::PeerDisconnected {
                        peer: self.central_addr.clone(),
                    },
                    self.step,
                );
            }
        }
    }

    fn route_peripheral_outbound(&mut self) -> bool {
        let responses = self.peripheral.radio_mut().take_responses();
        let notifications = self.peripheral.radio_mut().take_notifications();
        let moved = !responses.is_empty() || !notifications.is_empty();

        for (_, request, status, _) in responses {
            let Some(write) = self.in_flight.remove(&request) else {
                continue;
            };
            if status != ResponseStatus::Success {
                continue;
            }
            let event = match write {
                OutboundWrite::Descriptor {
                    token,
                    characteristic,
                } => CentralEvent::DescriptorWriteComplete {
                    token,
                    peer: self.peripheral_addr.clone(),
                    characteristic,
                },
                OutboundWrite::Characteristic {
                    token,
                    characteristic,
                } => CentralEvent::WriteComplete {
                    token,
                    peer: self.peripheral_addr.clone(),
                    characteristic,
                },
            };
            if let Some(dropped) = &self.drop_completions_for {
                let uuid = match &event {
                    CentralEvent::DescriptorWriteComplete { characteristic, .. }
                    | CentralEvent::WriteComplete { characteristic, .. } => characteristic,
                    _ => unreachable!(),
                };
                if uuid.eq_ignore_ascii_case(dropped) {
                    continue;
                }
            }
            self.central.handle_event(event, self.step);
        }

        if self.connected {
            for (_, payload) in notifications {
                self.central.handle_event(
                    CentralEvent::Notification {
                        token: self.link_token,
                        peer: self.peripheral_addr.clone(),
                        characteristic: tally_core::COUNTER_CHAR_UUID.to_string(),
                        payload,
                    },
                    self.step,
                );
            }
        }

        moved
    }
}

impl Default for LinkHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_session::SessionPhase;

    #[test]
    fn pump_settles_a_full_session_bring_up() {
        let mut link = LinkHarness::new();
        link.start_both();
        link.pump();

        assert!(link.is_connected());
        assert_eq!(link.central.phase(), SessionPhase::Ready);
        assert!(link.central.is_steady());
        assert_eq!(link.peripheral.subscriber_count(), 1);
    }

    #[test]
    fn pump_is_quiescent_once_settled() {
        let mut link = LinkHarness::new();
        link.start_both();
        link.pump();
        assert_eq!(link.pump(), 0, "settled link must not generate traffic");
    }
}
