//! The peripheral endpoint proper.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tally_core::uuids::{characteristic_from_uuid, is_subscription_descriptor, CharacteristicId};
use tally_core::wire::{self, SubscriptionSwitch};
use tally_core::{LinkError, PeerId, RequestId, ResponseStatus, SERVICE_UUID};
use tally_session::{
    require_start, CapabilityGate, PendingLedger, Role, Session, SessionEvent, SessionPhase,
    StatusSink,
};

use crate::radio::PeripheralRadio;

/// Peripheral endpoint configuration.
#[derive(Debug, Clone)]
pub struct PeripheralConfig {
    /// Human-readable device name carried in the advertisement.
    pub local_name: String,
    /// Steps before an unanswered inbound request is considered stalled.
    pub request_timeout_steps: u64,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            local_name: "tally-counter".to_string(),
            request_timeout_steps: 8,
        }
    }
}

/// Transport events delivered to the peripheral endpoint.
///
/// The platform stack delivers these asynchronously and out of order
/// relative to the endpoint's own calls; dispatch happens through
/// [`Peripheral::handle_event`] alone, which serializes every mutation of
/// the counter and the subscriber set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    PeerConnected {
        peer: PeerId,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    ReadRequest {
        peer: PeerId,
        request: RequestId,
        characteristic: String,
        offset: usize,
    },
    WriteRequest {
        peer: PeerId,
        request: RequestId,
        characteristic: String,
        payload: Vec<u8>,
        response_required: bool,
    },
    DescriptorWrite {
        peer: PeerId,
        request: RequestId,
        descriptor: String,
        payload: Vec<u8>,
        response_required: bool,
    },
}

/// Coarse endpoint counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralStats {
    pub reads_served: u64,
    pub resets_applied: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub requests_rejected: u64,
}

/// One live link to a remote central.
#[derive(Debug, Default)]
struct ConnectedPeer {
    /// Flipped only by an explicit subscription-descriptor write from this
    /// peer; discarded with the peer on disconnect.
    subscribed: bool,
}

/// Authoritative holder of the counter value.
///
/// All state lives behind `&mut self`: concurrent transport deliveries must
/// be funneled through one event-handling context, so a read in flight
/// always observes a consistent counter and subscriber set.
#[derive(Debug)]
pub struct Peripheral<R: PeripheralRadio, S: StatusSink> {
    radio: R,
    sink: S,
    config: PeripheralConfig,
    session: Session,
    counter: u32,
    peers: HashMap<PeerId, ConnectedPeer>,
    pending: PendingLedger,
    stats: PeripheralStats,
}

impl<R: PeripheralRadio, S: StatusSink> Peripheral<R, S> {
    pub fn new(radio: R, sink: S, config: PeripheralConfig) -> Self {
        Self {
            radio,
            sink,
            config,
            session: Session::new(Role::Peripheral),
            counter: 0,
            peers: HashMap::new(),
            pending: PendingLedger::default(),
            stats: PeripheralStats::default(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn stats(&self) -> PeripheralStats {
        self.stats
    }

    pub fn subscriber_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.subscribed).count()
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Starts advertising the counter service. Idempotent: restarting while
    /// already advertising is a no-op. Fails hard only when the capability
    /// gate or the platform advertiser refuses.
    pub fn start(&mut self, gate: &dyn CapabilityGate) -> Result<(), LinkError> {
        if self.session.phase() == SessionPhase::Advertising {
            return Ok(());
        }
        require_start(gate, Role::Peripheral)?;
        self.radio
            .start_advertising(SERVICE_UUID, &self.config.local_name)
            .map_err(|err| {
                warn!(?err, "advertising rejected by radio");
                LinkError::CapabilityUnavailable("advertiser unavailable")
            })?;
        self.session.handle(SessionEvent::Start);
        self.sink.phase_changed(self.session.phase());
        info!(name = %self.config.local_name, "advertising started");
        Ok(())
    }

    /// Releases all radio resources: stops advertising and forgets every
    /// connected peer. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.session.phase() == SessionPhase::Idle {
            return;
        }
        self.radio.stop_advertising();
        let had_subscribers = self.subscriber_count() > 0;
        for peer in self.peers.keys() {
            self.pending.drop_peer(peer);
        }
        self.peers.clear();
        self.session.handle(SessionEvent::Stop);
        self.sink.phase_changed(self.session.phase());
        if had_subscribers {
            self.sink.subscribers_changed(0);
        }
        info!("peripheral stopped");
    }

    /// Local mutation entry point; every change fans out synchronously.
    pub fn set_counter(&mut self, value: u32) {
        self.counter = value;
        self.sink.counter_changed(value);
        self.fan_out();
    }

    /// The peripheral's own "+1" control.
    pub fn increment(&mut self) {
        self.set_counter(self.counter.wrapping_add(1));
    }

    /// Single dispatch point for transport events.
    ///
    /// Per-peer failures are logged and isolated; nothing here destabilizes
    /// the endpoint or other peers.
    pub fn handle_event(&mut self, event: PeripheralEvent, now_step: u64) {
        match event {
            PeripheralEvent::PeerConnected { peer } => {
                debug!(%peer, "peer connected");
                self.peers.insert(peer, ConnectedPeer::default());
            }
            PeripheralEvent::PeerDisconnected { peer } => {
                debug!(%peer, "peer disconnected");
                let removed = self.peers.remove(&peer);
                self.pending.drop_peer(&peer);
                if removed.is_some_and(|state| state.subscribed) {
                    self.sink.subscribers_changed(self.subscriber_count());
                }
            }
            PeripheralEvent::ReadRequest {
                peer,
                request,
                characteristic,
                offset,
            } => self.handle_read(peer, request, &characteristic, offset, now_step),
            PeripheralEvent::WriteRequest {
                peer,
                request,
                characteristic,
                payload,
                response_required,
            } => self.handle_write(
                peer,
                request,
                &characteristic,
                &payload,
                response_required,
                now_step,
            ),
            PeripheralEvent::DescriptorWrite {
                peer,
                request,
                descriptor,
                payload,
                response_required,
            } => self.handle_descriptor_write(
                peer,
                request,
                &descriptor,
                &payload,
                response_required,
                now_step,
            ),
        }
    }

    fn handle_read(
        &mut self,
        peer: PeerId,
        request: RequestId,
        characteristic: &str,
        offset: usize,
        now_step: u64,
    ) {
        self.open_request(&peer, request, now_step);
        match characteristic_from_uuid(characteristic) {
            Some(CharacteristicId::Counter) => {
                let value = wire::encode_counter(self.counter);
                if offset > value.len() {
                    self.stats.requests_rejected += 1;
                    self.answer(&peer, request, ResponseStatus::InvalidOffset, &[]);
                    return;
                }
                self.stats.reads_served += 1;
                self.answer(&peer, request, ResponseStatus::Success, &value[offset..]);
            }
            // Reset is write-only; anything else is not part of the service.
            _ => {
                self.stats.requests_rejected += 1;
                self.answer(&peer, request, ResponseStatus::NotSupported, &[]);
            }
        }
    }

    fn handle_write(
        &mut self,
        peer: PeerId,
        request: RequestId,
        characteristic: &str,
        payload: &[u8],
        response_required: bool,
        now_step: u64,
    ) {
        if response_required {
            self.open_request(&peer, request, now_step);
        }
        match characteristic_from_uuid(characteristic) {
            Some(CharacteristicId::Reset) => {
                if !payload.is_empty() {
                    // Fan out before acknowledging: a peer polling right
                    // after the ack must already see the zeroed value.
                    self.counter = 0;
                    self.stats.resets_applied += 1;
                    info!(%peer, "counter reset by peer");
                    self.sink.counter_changed(0);
                    self.fan_out();
                }
                if response_required {
                    self.answer(&peer, request, ResponseStatus::Success, &[]);
                }
            }
            _ => {
                self.stats.requests_rejected += 1;
                if response_required {
                    self.answer(&peer, request, ResponseStatus::NotSupported, &[]);
                } else {
                    warn!(%peer, characteristic, "write to unsupported characteristic dropped");
                }
            }
        }
    }

    fn handle_descriptor_write(
        &mut self,
        peer: PeerId,
        request: RequestId,
        descriptor: &str,
        payload: &[u8],
        response_required: bool,
        now_step: u64,
    ) {
        if response_required {
            self.open_request(&peer, request, now_step);
        }
        if !is_subscription_descriptor(descriptor) {
            self.stats.requests_rejected += 1;
            if response_required {
                self.answer(&peer, request, ResponseStatus::NotSupported, &[]);
            }
            return;
        }

        let Some(state) = self.peers.get_mut(&peer) else {
            // Descriptor write from a link we no longer track; stale.
            warn!(%peer, "subscription write from unknown peer dropped");
            if response_required {
                self.answer(&peer, request, ResponseStatus::NotSupported, &[]);
            }
            return;
        };

        match wire::parse_subscription_switch(payload) {
            Some(SubscriptionSwitch::Enable) => {
                if !state.subscribed {
                    state.subscribed = true;
                    info!(%peer, "notifications enabled");
                    self.sink.subscribers_changed(self.subscriber_count());
                }
            }
            Some(SubscriptionSwitch::Disable) => {
                if state.subscribed {
                    state.subscribed = false;
                    info!(%peer, "notifications disabled");
                    self.sink.subscribers_changed(self.subscriber_count());
                }
            }
            // Unrecognized flag value; subscription state is untouched but
            // the descriptor is ours, so the write still acks as success.
            None => debug!(%peer, "ignoring unrecognized subscription payload"),
        }
        if response_required {
            self.answer(&peer, request, ResponseStatus::Success, &[]);
        }
    }

    fn open_request(&mut self, peer: &PeerId, request: RequestId, now_step: u64) {
        if !self.pending.open(
            peer.clone(),
            request,
            now_step,
            self.config.request_timeout_steps,
        ) {
            warn!(%peer, ?request, "request id replayed while still in flight");
        }
    }

    /// Sends exactly one response for an open request. A second answer for
    /// the same request is dropped here rather than sent twice.
    fn answer(&mut self, peer: &PeerId, request: RequestId, status: ResponseStatus, value: &[u8]) {
        if !self.pending.settle(peer, request) {
            warn!(%peer, ?request, "suppressing duplicate response");
            return;
        }
        if let Err(err) = self.radio.send_response(peer, request, status, value) {
            // The peer's stack may stall on a lost response, but that is
            // its link to lose; other peers are unaffected.
            warn!(%peer, ?err, "failed to deliver response");
        }
    }

    /// Pushes the current value to every peer subscribed at this moment.
    /// One peer's failure never aborts delivery to the rest.
    fn fan_out(&mut self) {
        let payload = wire::encode_counter(self.counter);
        for (peer, state) in &self.peers {
            if !state.subscribed {
                continue;
            }
            match self.radio.notify(peer, &payload) {
                Ok(()) => self.stats.notifications_sent += 1,
                Err(err) => {
                    warn!(%peer, ?err, "notify failed; skipping peer");
                    self.stats.notifications_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::MockPeripheralRadio;
    use tally_core::uuids::{CCCD_UUID, COUNTER_CHAR_UUID, RESET_CHAR_UUID};
    use tally_core::wire::{CCCD_DISABLE, CCCD_ENABLE, RESET_TRIGGER};
    use tally_session::{FixedGate, NullSink, RecordingSink};

    fn started_peripheral() -> Peripheral<MockPeripheralRadio, RecordingSink> {
        let mut peripheral = Peripheral::new(
            MockPeripheralRadio::default(),
            RecordingSink::default(),
            PeripheralConfig::default(),
        );
        peripheral
            .start(&FixedGate::all_granted())
            .expect("start should succeed");
        peripheral
    }

    fn connect(peripheral: &mut Peripheral<MockPeripheralRadio, RecordingSink>, addr: &str) -> PeerId {
        let peer = PeerId::new(addr);
        peripheral.handle_event(
            PeripheralEvent::PeerConnected { peer: peer.clone() },
            0,
        );
        peer
    }

    fn subscribe(
        peripheral: &mut Peripheral<MockPeripheralRadio, RecordingSink>,
        peer: &PeerId,
        request: u32,
    ) {
        peripheral.handle_event(
            PeripheralEvent::DescriptorWrite {
                peer: peer.clone(),
                request: RequestId(request),
                descriptor: CCCD_UUID.to_string(),
                payload: CCCD_ENABLE.to_vec(),
                response_required: true,
            },
            0,
        );
    }

    #[test]
    fn start_is_idempotent_and_advertises_the_service() {
        let mut peripheral = started_peripheral();
        peripheral
            .start(&FixedGate::all_granted())
            .expect("restart should be a no-op");
        let (service, name) = peripheral
            .radio_mut()
            .advertised()
            .cloned()
            .expect("should be advertising");
        assert_eq!(service, SERVICE_UUID);
        assert_eq!(name, "tally-counter");
    }

    #[test]
    fn start_fails_when_gate_withholds_capability() {
        let mut peripheral = Peripheral::new(
            MockPeripheralRadio::default(),
            NullSink,
            PeripheralConfig::default(),
        );
        assert_eq!(
            peripheral.start(&FixedGate::radio_off()),
            Err(LinkError::CapabilityUnavailable("radio disabled"))
        );
        assert_eq!(peripheral.phase(), SessionPhase::Idle);
    }

    #[test]
    fn start_fails_when_advertiser_is_unavailable() {
        let mut peripheral = Peripheral::new(
            MockPeripheralRadio::without_advertiser(),
            NullSink,
            PeripheralConfig::default(),
        );
        assert_eq!(
            peripheral.start(&FixedGate::all_granted()),
            Err(LinkError::CapabilityUnavailable("advertiser unavailable"))
        );
    }

    #[test]
    fn read_returns_the_most_recently_applied_value() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");
        peripheral.set_counter(41);

        peripheral.handle_event(
            PeripheralEvent::ReadRequest {
                peer: peer.clone(),
                request: RequestId(1),
                characteristic: COUNTER_CHAR_UUID.to_string(),
                offset: 0,
            },
            0,
        );

        let responses = peripheral.radio_mut().take_responses();
        assert_eq!(responses.len(), 1);
        let (_, _, status, value) = &responses[0];
        assert_eq!(*status, ResponseStatus::Success);
        assert_eq!(value, &wire::encode_counter(41).to_vec());
    }

    #[test]
    fn read_honors_the_requested_offset() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");
        peripheral.set_counter(0x0102_0304);

        peripheral.handle_event(
            PeripheralEvent::ReadRequest {
                peer: peer.clone(),
                request: RequestId(1),
                characteristic: COUNTER_CHAR_UUID.to_string(),
                offset: 2,
            },
            0,
        );
        let responses = peripheral.radio_mut().take_responses();
        assert_eq!(responses[0].3, vec![0x02, 0x01]);

        peripheral.handle_event(
            PeripheralEvent::ReadRequest {
                peer,
                request: RequestId(2),
                characteristic: COUNTER_CHAR_UUID.to_string(),
                offset: 9,
            },
            0,
        );
        let responses = peripheral.radio_mut().take_responses();
        assert_eq!(responses[0].2, ResponseStatus::InvalidOffset);
    }

    #[test]
    fn unknown_characteristic_read_is_rejected_not_silenced() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");

        peripheral.handle_event(
            PeripheralEvent::ReadRequest {
                peer,
                request: RequestId(1),
                characteristic: RESET_CHAR_UUID.to_string(),
                offset: 0,
            },
            0,
        );

        let responses = peripheral.radio_mut().take_responses();
        assert_eq!(responses.len(), 1, "every read gets exactly one response");
        assert_eq!(responses[0].2, ResponseStatus::NotSupported);
        assert_eq!(peripheral.stats().requests_rejected, 1);
    }

    #[test]
    fn each_mutation_notifies_every_subscriber_exactly_once() {
        let mut peripheral = started_peripheral();
        let alpha = connect(&mut peripheral, "alpha");
        let beta = connect(&mut peripheral, "beta");
        let quiet = connect(&mut peripheral, "quiet");
        subscribe(&mut peripheral, &alpha, 1);
        subscribe(&mut peripheral, &beta, 2);
        peripheral.radio_mut().take_responses();

        peripheral.set_counter(5);
        peripheral.increment();

        let notifications = peripheral.radio_mut().take_notifications();
        assert_eq!(notifications.len(), 4, "two mutations, two subscribers");
        let for_alpha: Vec<_> = notifications
            .iter()
            .filter(|(peer, _)| *peer == alpha)
            .map(|(_, value)| value.clone())
            .collect();
        assert_eq!(
            for_alpha,
            vec![
                wire::encode_counter(5).to_vec(),
                wire::encode_counter(6).to_vec()
            ],
            "per-peer notifications arrive in mutation order"
        );
        assert!(
            !notifications.iter().any(|(peer, _)| *peer == quiet),
            "unsubscribed peers receive zero notifications"
        );
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");
        subscribe(&mut peripheral, &peer, 1);
        peripheral.handle_event(
            PeripheralEvent::DescriptorWrite {
                peer: peer.clone(),
                request: RequestId(2),
                descriptor: CCCD_UUID.to_string(),
                payload: CCCD_DISABLE.to_vec(),
                response_required: true,
            },
            0,
        );
        peripheral.radio_mut().take_notifications();

        peripheral.increment();
        assert!(peripheral.radio_mut().take_notifications().is_empty());
        assert_eq!(peripheral.subscriber_count(), 0);
    }

    #[test]
    fn reset_zeroes_fans_out_then_acks() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");
        subscribe(&mut peripheral, &peer, 1);
        peripheral.radio_mut().take_responses();
        peripheral.radio_mut().take_notifications();
        peripheral.set_counter(9);
        peripheral.radio_mut().take_notifications();

        peripheral.handle_event(
            PeripheralEvent::WriteRequest {
                peer: peer.clone(),
                request: RequestId(2),
                characteristic: RESET_CHAR_UUID.to_string(),
                payload: RESET_TRIGGER.to_vec(),
                response_required: true,
            },
            0,
        );

        assert_eq!(peripheral.counter(), 0);
        let notifications = peripheral.radio_mut().take_notifications();
        assert_eq!(notifications, vec![(peer.clone(), wire::encode_counter(0).to_vec())]);
        let responses = peripheral.radio_mut().take_responses();
        assert_eq!(responses, vec![(peer, RequestId(2), ResponseStatus::Success, vec![])]);
    }

    #[test]
    fn reset_when_already_zero_still_notifies_once() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");
        subscribe(&mut peripheral, &peer, 1);
        peripheral.radio_mut().take_notifications();
        assert_eq!(peripheral.counter(), 0);

        peripheral.handle_event(
            PeripheralEvent::WriteRequest {
                peer: peer.clone(),
                request: RequestId(2),
                characteristic: RESET_CHAR_UUID.to_string(),
                payload: vec![0xFF],
                response_required: false,
            },
            0,
        );

        let notifications = peripheral.radio_mut().take_notifications();
        assert_eq!(notifications, vec![(peer, wire::encode_counter(0).to_vec())]);
    }

    #[test]
    fn empty_reset_payload_is_acked_but_does_nothing() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");
        peripheral.set_counter(3);

        peripheral.handle_event(
            PeripheralEvent::WriteRequest {
                peer: peer.clone(),
                request: RequestId(1),
                characteristic: RESET_CHAR_UUID.to_string(),
                payload: vec![],
                response_required: true,
            },
            0,
        );

        assert_eq!(peripheral.counter(), 3);
        assert_eq!(peripheral.stats().resets_applied, 0);
        let responses = peripheral.radio_mut().take_responses();
        assert_eq!(responses[0].2, ResponseStatus::Success);
    }

    #[test]
    fn one_failing_peer_does_not_abort_fan_out() {
        let mut peripheral = started_peripheral();
        let down = connect(&mut peripheral, "down");
        let up = connect(&mut peripheral, "up");
        subscribe(&mut peripheral, &down, 1);
        subscribe(&mut peripheral, &up, 2);
        peripheral.radio_mut().fail_notify_for(down);
        peripheral.radio_mut().take_notifications();

        peripheral.set_counter(1);

        let notifications = peripheral.radio_mut().take_notifications();
        assert_eq!(notifications, vec![(up, wire::encode_counter(1).to_vec())]);
        assert_eq!(peripheral.stats().notifications_failed, 1);
        assert_eq!(peripheral.stats().notifications_sent, 1);
    }

    #[test]
    fn disconnect_discards_the_subscription() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");
        subscribe(&mut peripheral, &peer, 1);
        assert_eq!(peripheral.subscriber_count(), 1);

        peripheral.handle_event(PeripheralEvent::PeerDisconnected { peer }, 0);
        assert_eq!(peripheral.subscriber_count(), 0);

        peripheral.increment();
        assert!(peripheral.radio_mut().take_notifications().is_empty());
    }

    #[test]
    fn subscription_from_untracked_peer_registers_nothing() {
        let mut peripheral = started_peripheral();
        let gone = connect(&mut peripheral, "gone");
        peripheral.handle_event(
            PeripheralEvent::PeerDisconnected { peer: gone.clone() },
            0,
        );
        let never = PeerId::new("never-connected");

        // CCCD writes straggling in after a disconnect, or arriving for a
        // link that was never established, must not create subscribers.
        for (peer, request) in [(gone, 1), (never, 2)] {
            peripheral.handle_event(
                PeripheralEvent::DescriptorWrite {
                    peer,
                    request: RequestId(request),
                    descriptor: CCCD_UUID.to_string(),
                    payload: CCCD_ENABLE.to_vec(),
                    response_required: true,
                },
                0,
            );
        }

        assert_eq!(peripheral.subscriber_count(), 0);
        let responses = peripheral.radio_mut().take_responses();
        assert_eq!(responses.len(), 2, "stale writes are still answered");
        assert!(responses
            .iter()
            .all(|(_, _, status, _)| *status == ResponseStatus::NotSupported));

        peripheral.increment();
        assert!(peripheral.radio_mut().take_notifications().is_empty());
    }

    #[test]
    fn mutations_push_to_the_status_sink() {
        let mut peripheral = started_peripheral();
        peripheral.set_counter(2);
        peripheral.increment();
        // The sink is consumed with the peripheral; check via destructuring.
        let Peripheral { sink, .. } = peripheral;
        assert_eq!(sink.counters, vec![2, 3]);
        assert_eq!(sink.phases, vec![SessionPhase::Advertising]);
    }

    #[test]
    fn stop_releases_radio_and_peers() {
        let mut peripheral = started_peripheral();
        let peer = connect(&mut peripheral, "aa");
        subscribe(&mut peripheral, &peer, 1);

        peripheral.stop();
        peripheral.stop();

        assert_eq!(peripheral.phase(), SessionPhase::Idle);
        assert!(!peripheral.radio_mut().is_advertising());
        assert_eq!(peripheral.subscriber_count(), 0);
        peripheral.increment();
        assert!(peripheral.radio_mut().take_notifications().is_empty());
    }
}
