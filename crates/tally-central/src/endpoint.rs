//! The central endpoint proper.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tally_core::uuids::{advertises_counter_service, characteristic_from_uuid, CharacteristicId};
use tally_core::wire::{self, CCCD_ENABLE, RESET_TRIGGER};
use tally_core::{LinkError, PeerId, RequestId, SessionToken, CCCD_UUID, SERVICE_UUID};
use tally_session::{
    require_start, CapabilityGate, PendingLedger, Role, Session, SessionEvent, SessionPhase,
    StatusSink,
};

use crate::radio::CentralRadio;

/// Central endpoint configuration.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    /// Re-enter scanning automatically after a link loss. Off by default;
    /// retry policy belongs to the caller.
    pub resume_scan_on_disconnect: bool,
    /// Steps before an unanswered subscribe/reset write times out.
    pub request_timeout_steps: u64,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            resume_scan_on_disconnect: false,
            request_timeout_steps: 8,
        }
    }
}

/// Transport events delivered to the central endpoint.
///
/// Every event is stamped with the token of the session its originating
/// command was issued under; events from a defunct session are discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    AdvertisementSeen {
        token: SessionToken,
        peer: PeerId,
        services: Vec<String>,
        local_name: Option<String>,
    },
    ConnectionChanged {
        token: SessionToken,
        peer: PeerId,
        connected: bool,
    },
    ServicesDiscovered {
        token: SessionToken,
        peer: PeerId,
        characteristics: Vec<String>,
    },
    DescriptorWriteComplete {
        token: SessionToken,
        peer: PeerId,
        characteristic: String,
    },
    WriteComplete {
        token: SessionToken,
        peer: PeerId,
        characteristic: String,
    },
    Notification {
        token: SessionToken,
        peer: PeerId,
        characteristic: String,
        payload: Vec<u8>,
    },
    ScanFailed {
        token: SessionToken,
        reason: String,
    },
}

/// Coarse endpoint counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentralStats {
    pub notifications_decoded: u64,
    pub payloads_ignored: u64,
    pub resets_sent: u64,
    pub request_timeouts: u64,
    pub scan_failures: u64,
    pub stale_events: u64,
}

/// Characteristic handles cached after a successful discovery.
///
/// Invalidated on disconnect; a reconnection re-discovers from scratch.
#[derive(Debug, Clone)]
struct CharacteristicHandles {
    counter: String,
    reset: String,
}

/// Observer/controller side of the link.
///
/// Drives exactly one outbound connection per attempt and never holds
/// authoritative state, only the last counter value it observed.
#[derive(Debug)]
pub struct Central<R: CentralRadio, S: StatusSink> {
    radio: R,
    sink: S,
    config: CentralConfig,
    session: Session,
    target: Option<PeerId>,
    handles: Option<CharacteristicHandles>,
    steady: bool,
    last_counter: Option<u32>,
    pending: PendingLedger,
    pending_subscribe: Option<RequestId>,
    pending_reset: Option<RequestId>,
    next_request: u32,
    stats: CentralStats,
}

impl<R: CentralRadio, S: StatusSink> Central<R, S> {
    pub fn new(radio: R, sink: S, config: CentralConfig) -> Self {
        Self {
            radio,
            sink,
            config,
            session: Session::new(Role::Central),
            target: None,
            handles: None,
            steady: false,
            last_counter: None,
            pending: PendingLedger::default(),
            pending_subscribe: None,
            pending_reset: None,
            next_request: 0,
            stats: CentralStats::default(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    /// Token stamping commands of the current session.
    pub fn token(&self) -> SessionToken {
        self.session.token()
    }

    /// Last counter value observed via notification, if any.
    pub fn last_counter(&self) -> Option<u32> {
        self.last_counter
    }

    /// Whether the subscription write completed and notifications flow.
    pub fn is_steady(&self) -> bool {
        self.steady
    }

    pub fn stats(&self) -> CentralStats {
        self.stats
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Starts scanning for the counter service. Idempotent while scanning.
    pub fn start_scan(&mut self, gate: &dyn CapabilityGate) -> Result<(), LinkError> {
        match self.session.phase() {
            SessionPhase::Scanning => return Ok(()),
            SessionPhase::Idle | SessionPhase::Disconnected => {}
            _ => return Err(LinkError::NotSupported("scan requested mid-session")),
        }
        require_start(gate, Role::Central)?;
        self.session.handle(SessionEvent::Start);
        let token = self.session.token();
        if let Err(err) = self.radio.start_scan(token, SERVICE_UUID) {
            warn!(?err, "scan rejected by radio");
            self.session.handle(SessionEvent::Stop);
            return Err(LinkError::CapabilityUnavailable("scanner unavailable"));
        }
        self.sink.phase_changed(self.session.phase());
        info!("scan started");
        Ok(())
    }

    /// Stops an in-progress scan. No-op in any other phase.
    pub fn stop_scan(&mut self) {
        if self.session.phase() != SessionPhase::Scanning {
            return;
        }
        self.radio.stop_scan();
        self.session.handle(SessionEvent::Stop);
        self.sink.phase_changed(self.session.phase());
    }

    /// Releases the link, invalidates cached handles, and returns to idle.
    /// Safe to call multiple times.
    pub fn close(&mut self) {
        if let Some(peer) = self.target.take() {
            self.radio.disconnect(&peer);
            self.pending.drop_peer(&peer);
        }
        if self.session.phase() == SessionPhase::Scanning {
            self.radio.stop_scan();
        }
        if self.session.phase() != SessionPhase::Idle {
            self.session.handle(SessionEvent::Stop);
            self.sink.phase_changed(self.session.phase());
        }
        self.handles = None;
        self.steady = false;
        self.pending_subscribe = None;
        self.pending_reset = None;
    }

    /// Writes the reset trigger to the reset characteristic.
    ///
    /// Fire-and-forget: the authoritative confirmation is the subsequent
    /// notification carrying value 0, not the write's local acknowledgement.
    pub fn send_reset(&mut self, now_step: u64) -> Result<(), LinkError> {
        if self.session.phase() != SessionPhase::Ready {
            return Err(LinkError::ConnectionLost);
        }
        // One reset in flight at a time; completions correlate by
        // characteristic only, so overlapping writes would cross-settle.
        if self.pending_reset.is_some() {
            return Err(LinkError::NotSupported("reset already in flight"));
        }
        let (peer, reset_uuid) = match (&self.target, &self.handles) {
            (Some(peer), Some(handles)) => (peer.clone(), handles.reset.clone()),
            _ => return Err(LinkError::ConnectionLost),
        };
        let request = self.alloc_request();
        self.pending.open(
            peer.clone(),
            request,
            now_step,
            self.config.request_timeout_steps,
        );
        self.pending_reset = Some(request);
        let token = self.session.token();
        self.radio
            .write_characteristic(token, &peer, &reset_uuid, &RESET_TRIGGER)
            .map_err(|err| {
                warn!(?err, "reset write rejected by radio");
                self.pending.settle(&peer, request);
                self.pending_reset = None;
                LinkError::ConnectionLost
            })?;
        self.stats.resets_sent += 1;
        info!(%peer, "reset sent");
        Ok(())
    }

    /// Expires pending writes whose response window has passed.
    ///
    /// Returns the number of exchanges that timed out. Timed-out requests
    /// are caller-visible through [`CentralStats`]; the core does not retry.
    pub fn pump_timeouts(&mut self, now_step: u64) -> usize {
        let due = self.pending.expire_due(now_step);
        for (peer, request) in &due {
            warn!(%peer, ?request, "pending request timed out");
            self.stats.request_timeouts += 1;
            if self.pending_subscribe == Some(*request) {
                self.pending_subscribe = None;
            }
            if self.pending_reset == Some(*request) {
                self.pending_reset = None;
            }
        }
        due.len()
    }

    /// Single dispatch point for transport events.
    pub fn handle_event(&mut self, event: CentralEvent, now_step: u64) {
        let token = match &event {
            CentralEvent::AdvertisementSeen { token, .. }
            | CentralEvent::ConnectionChanged { token, .. }
            | CentralEvent::ServicesDiscovered { token, .. }
            | CentralEvent::DescriptorWriteComplete { token, .. }
            | CentralEvent::WriteComplete { token, .. }
            | CentralEvent::Notification { token, .. }
            | CentralEvent::ScanFailed { token, .. } => *token,
        };
        if !self.session.accepts(token) {
            debug!(?token, "discarding event from defunct session");
            self.stats.stale_events += 1;
            return;
        }

        match event {
            CentralEvent::AdvertisementSeen {
                peer,
                services,
                local_name,
                ..
            } => self.handle_advertisement(peer, &services, local_name),
            CentralEvent::ConnectionChanged {
                peer, connected, ..
            } => self.handle_connection_changed(peer, connected),
            CentralEvent::ServicesDiscovered {
                peer,
                characteristics,
                ..
            } => self.handle_services_discovered(peer, &characteristics, now_step),
            CentralEvent::DescriptorWriteComplete {
                peer,
                characteristic,
                ..
            } => self.handle_descriptor_write_complete(peer, &characteristic),
            CentralEvent::WriteComplete {
                peer,
                characteristic,
                ..
            } => self.handle_write_complete(peer, &characteristic),
            CentralEvent::Notification {
                characteristic,
                payload,
                ..
            } => self.handle_notification(&characteristic, &payload),
            CentralEvent::ScanFailed { reason, .. } => {
                warn!(reason, "scan failed");
                self.stats.scan_failures += 1;
            }
        }
    }

    /// First matching advertisement wins: the scan stops and a connection
    /// attempt begins in one atomic handoff. Later advertisements find the
    /// session past `Scanning` and fall through.
    fn handle_advertisement(
        &mut self,
        peer: PeerId,
        services: &[String],
        local_name: Option<String>,
    ) {
        if self.session.phase() != SessionPhase::Scanning {
            return;
        }
        if !advertises_counter_service(services) {
            return;
        }
        info!(%peer, name = ?local_name, "counter service found");
        self.radio.stop_scan();
        self.session.handle(SessionEvent::AdvertisementMatched);
        self.sink.phase_changed(self.session.phase());
        self.target = Some(peer.clone());
        let token = self.session.token();
        if let Err(err) = self.radio.connect(token, &peer) {
            warn!(%peer, ?err, "connect rejected by radio");
            self.session.handle(SessionEvent::ConnectFailed);
            self.sink.phase_changed(self.session.phase());
            self.target = None;
        }
    }

    fn handle_connection_changed(&mut self, peer: PeerId, connected: bool) {
        if self.target.as_ref() != Some(&peer) {
            debug!(%peer, "connection change for untracked peer dropped");
            return;
        }
        if connected {
            if self.session.phase() != SessionPhase::Connecting {
                return;
            }
            self.session.handle(SessionEvent::ConnectSucceeded);
            self.sink.phase_changed(self.session.phase());
            self.session.handle(SessionEvent::DiscoveryStarted);
            self.sink.phase_changed(self.session.phase());
            let token = self.session.token();
            if let Err(err) = self.radio.discover_services(token, &peer) {
                warn!(%peer, ?err, "discovery rejected by radio");
                self.handle_link_loss();
            }
        } else {
            self.handle_link_loss();
        }
    }

    fn handle_link_loss(&mut self) {
        info!("link lost");
        if let Some(peer) = self.target.take() {
            self.pending.drop_peer(&peer);
        }
        self.handles = None;
        self.steady = false;
        self.pending_subscribe = None;
        self.pending_reset = None;
        self.session.handle(SessionEvent::LinkLost);
        self.sink.phase_changed(self.session.phase());

        if self.config.resume_scan_on_disconnect {
            self.session.handle(SessionEvent::Start);
            let token = self.session.token();
            match self.radio.start_scan(token, SERVICE_UUID) {
                Ok(()) => {
                    self.sink.phase_changed(self.session.phase());
                    info!("scan resumed after link loss");
                }
                Err(err) => {
                    // Same rollback as start_scan: the phase must not claim
                    // a scan that is not running.
                    warn!(?err, "scan resume rejected by radio");
                    self.stats.scan_failures += 1;
                    self.session.handle(SessionEvent::Stop);
                    self.sink.phase_changed(self.session.phase());
                }
            }
        }
    }

    /// Both characteristics must resolve before the endpoint is usable;
    /// missing either is a hard discovery failure, not a partial state.
    fn handle_services_discovered(
        &mut self,
        peer: PeerId,
        characteristics: &[String],
        now_step: u64,
    ) {
        if self.session.phase() != SessionPhase::Discovering
            || self.target.as_ref() != Some(&peer)
        {
            return;
        }
        let find = |id: CharacteristicId| {
            characteristics
                .iter()
                .find(|uuid| characteristic_from_uuid(uuid) == Some(id))
                .cloned()
        };
        let (Some(counter), Some(reset)) =
            (find(CharacteristicId::Counter), find(CharacteristicId::Reset))
        else {
            warn!(%peer, "expected characteristics absent; abandoning peer");
            self.session.handle(SessionEvent::ServiceMissing);
            self.sink.phase_changed(self.session.phase());
            self.radio.disconnect(&peer);
            self.target = None;
            return;
        };

        self.handles = Some(CharacteristicHandles {
            counter: counter.clone(),
            reset,
        });
        self.session.handle(SessionEvent::ServicesResolved);
        self.sink.phase_changed(self.session.phase());

        // Subscribe immediately; steady state is reached when this write
        // completes, not before.
        let request = self.alloc_request();
        self.pending.open(
            peer.clone(),
            request,
            now_step,
            self.config.request_timeout_steps,
        );
        self.pending_subscribe = Some(request);
        let token = self.session.token();
        if let Err(err) =
            self.radio
                .write_descriptor(token, &peer, &counter, CCCD_UUID, &CCCD_ENABLE)
        {
            warn!(%peer, ?err, "subscription write rejected by radio");
            self.pending.settle(&peer, request);
            self.pending_subscribe = None;
        }
    }

    fn handle_descriptor_write_complete(&mut self, peer: PeerId, characteristic: &str) {
        let Some(request) = self.pending_subscribe else {
            return;
        };
        let counter_uuid = match &self.handles {
            Some(handles) => handles.counter.clone(),
            None => return,
        };
        if !characteristic.eq_ignore_ascii_case(&counter_uuid) {
            return;
        }
        if !self.pending.settle(&peer, request) {
            debug!(%peer, "duplicate subscription completion dropped");
            return;
        }
        self.pending_subscribe = None;
        self.steady = true;
        self.session.handle(SessionEvent::SubscriptionActive);
        info!(%peer, "subscription active");
    }

    fn handle_write_complete(&mut self, peer: PeerId, characteristic: &str) {
        let Some(request) = self.pending_reset else {
            return;
        };
        let reset_uuid = match &self.handles {
            Some(handles) => handles.reset.clone(),
            None => return,
        };
        if !characteristic.eq_ignore_ascii_case(&reset_uuid) {
            return;
        }
        if self.pending.settle(&peer, request) {
            self.pending_reset = None;
            debug!(%peer, "reset write acknowledged");
        }
    }

    /// Counter payloads surface to the sink; unrecognized characteristics
    /// are ignored, not errors.
    fn handle_notification(&mut self, characteristic: &str, payload: &[u8]) {
        if characteristic_from_uuid(characteristic) != Some(CharacteristicId::Counter) {
            self.stats.payloads_ignored += 1;
            return;
        }
        match wire::decode_counter(payload) {
            Ok(value) => {
                self.last_counter = Some(value);
                self.stats.notifications_decoded += 1;
                self.sink.counter_changed(value);
            }
            Err(err) => {
                debug!(%err, "undecodable counter payload ignored");
                self.stats.payloads_ignored += 1;
            }
        }
    }

    fn alloc_request(&mut self) -> RequestId {
        let request = RequestId(self.next_request);
        self.next_request = self.next_request.wrapping_add(1);
        request
    }
}
