//! Connection-lifecycle state machine.
//!
//! The transport is callback-driven and out-of-order, so both endpoints run
//! their lifecycle through one dispatch function keyed by event variant.
//! Transitions and their side effects stay testable without a live radio.

use tally_core::{LinkError, SessionToken};

/// Which side of the link this session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Advertises the service and holds authoritative counter state.
    Peripheral,
    /// Scans, connects, discovers, and subscribes.
    Central,
}

/// Lifecycle phase of one endpoint.
///
/// `Disconnected` is terminal per connection attempt; a new `Start` re-enters
/// the advertising/scanning phase for the next session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Advertising,
    Scanning,
    Connecting,
    Connected,
    Discovering,
    Ready,
    Disconnected,
}

/// Lifecycle events fed into [`Session::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Endpoint start requested; prerequisites already gated.
    Start,
    /// A scanned advertisement matched the expected service (central).
    AdvertisementMatched,
    /// Transport reported the connection attempt succeeded.
    ConnectSucceeded,
    /// Transport reported the connection attempt failed or timed out.
    ConnectFailed,
    /// Central began enumerating the remote's services.
    DiscoveryStarted,
    /// Both expected characteristics were resolved.
    ServicesResolved,
    /// The expected service or a characteristic was absent.
    ServiceMissing,
    /// The subscription descriptor write completed; steady state.
    SubscriptionActive,
    /// Link loss at any time, peer-initiated or local.
    LinkLost,
    /// Host lifecycle stop; release everything.
    Stop,
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStep {
    /// Phase changed.
    Transition { from: SessionPhase, to: SessionPhase },
    /// Steady-state event with no phase change.
    Stayed,
    /// Event is not meaningful in the current phase; dropped.
    Ignored,
    /// Phase moved to `Disconnected` carrying a caller-visible error.
    Failed { from: SessionPhase, error: LinkError },
}

/// Per-endpoint session state machine.
///
/// Symmetric in shape across both roles, asymmetric in responsibility: the
/// peripheral instance tracks its advertising lifecycle while serving many
/// peers through its own arena; the central instance drives exactly one
/// outbound connection per attempt.
#[derive(Debug)]
pub struct Session {
    role: Role,
    phase: SessionPhase,
    token: SessionToken,
    next_token: u64,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: SessionPhase::Idle,
            token: SessionToken(0),
            next_token: 1,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Token identifying the current connection attempt. Commands issued to
    /// the radio are stamped with this; the matching events echo it back.
    pub fn token(&self) -> SessionToken {
        self.token
    }

    /// Whether an event stamped with `token` belongs to the live session.
    /// Stale callbacks from a defunct session must be discarded.
    pub fn accepts(&self, token: SessionToken) -> bool {
        token == self.token
    }

    fn bump_token(&mut self) {
        self.token = SessionToken(self.next_token);
        self.next_token += 1;
    }

    fn move_to(&mut self, to: SessionPhase) -> SessionStep {
        let from = self.phase;
        self.phase = to;
        SessionStep::Transition { from, to }
    }

    fn fail_to_disconnected(&mut self, error: LinkError) -> SessionStep {
        let from = self.phase;
        self.phase = SessionPhase::Disconnected;
        self.bump_token();
        SessionStep::Failed { from, error }
    }

    /// Single dispatch point for all lifecycle events.
    pub fn handle(&mut self, event: SessionEvent) -> SessionStep {
        use SessionEvent as E;
        use SessionPhase as P;

        match (self.phase, event) {
            // Restarting while already started is a no-op, not an error.
            (P::Advertising, E::Start) if self.role == Role::Peripheral => SessionStep::Stayed,
            (P::Scanning, E::Start) if self.role == Role::Central => SessionStep::Stayed,
            (P::Idle | P::Disconnected, E::Start) => {
                self.bump_token();
                match self.role {
                    Role::Peripheral => self.move_to(P::Advertising),
                    Role::Central => self.move_to(P::Scanning),
                }
            }

            // Scanning stops on first match; at most one connection attempt
            // per scan cycle.
            (P::Scanning, E::AdvertisementMatched) if self.role == Role::Central => {
                self.move_to(P::Connecting)
            }

            (P::Connecting, E::ConnectSucceeded) => self.move_to(P::Connected),
            (P::Connecting, E::ConnectFailed) => {
                self.fail_to_disconnected(LinkError::ConnectionLost)
            }

            (P::Connected, E::DiscoveryStarted) if self.role == Role::Central => {
                self.move_to(P::Discovering)
            }
            (P::Discovering, E::ServicesResolved) => self.move_to(P::Ready),
            (P::Discovering, E::ServiceMissing) => self.fail_to_disconnected(
                LinkError::ServiceMismatch("expected characteristics absent"),
            ),

            (P::Ready, E::SubscriptionActive) => SessionStep::Stayed,

            (
                P::Connecting | P::Connected | P::Discovering | P::Ready,
                E::LinkLost,
            ) => self.fail_to_disconnected(LinkError::ConnectionLost),

            (P::Idle, E::Stop) => SessionStep::Stayed,
            (_, E::Stop) => {
                self.bump_token();
                self.move_to(P::Idle)
            }

            _ => SessionStep::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_to(session: &mut Session, event: SessionEvent, expected: SessionPhase) {
        session.handle(event);
        assert_eq!(session.phase(), expected, "after {event:?}");
    }

    #[test]
    fn central_walks_the_full_lifecycle() {
        let mut session = Session::new(Role::Central);
        assert_eq!(session.phase(), SessionPhase::Idle);

        step_to(&mut session, SessionEvent::Start, SessionPhase::Scanning);
        step_to(
            &mut session,
            SessionEvent::AdvertisementMatched,
            SessionPhase::Connecting,
        );
        step_to(
            &mut session,
            SessionEvent::ConnectSucceeded,
            SessionPhase::Connected,
        );
        step_to(
            &mut session,
            SessionEvent::DiscoveryStarted,
            SessionPhase::Discovering,
        );
        step_to(
            &mut session,
            SessionEvent::ServicesResolved,
            SessionPhase::Ready,
        );
        assert_eq!(
            session.handle(SessionEvent::SubscriptionActive),
            SessionStep::Stayed
        );
    }

    #[test]
    fn failure_steps_clone_for_reporting() {
        let step = SessionStep::Failed {
            from: SessionPhase::Connecting,
            error: LinkError::ConnectionLost,
        };
        let reported = step.clone();
        assert_eq!(step, reported);
    }

    #[test]
    fn peripheral_start_enters_advertising_and_is_idempotent() {
        let mut session = Session::new(Role::Peripheral);
        step_to(&mut session, SessionEvent::Start, SessionPhase::Advertising);
        assert_eq!(session.handle(SessionEvent::Start), SessionStep::Stayed);
        assert_eq!(session.phase(), SessionPhase::Advertising);
    }

    #[test]
    fn connect_failure_surfaces_connection_lost() {
        let mut session = Session::new(Role::Central);
        session.handle(SessionEvent::Start);
        session.handle(SessionEvent::AdvertisementMatched);

        let step = session.handle(SessionEvent::ConnectFailed);
        assert_eq!(
            step,
            SessionStep::Failed {
                from: SessionPhase::Connecting,
                error: LinkError::ConnectionLost,
            }
        );
        assert_eq!(session.phase(), SessionPhase::Disconnected);
    }

    #[test]
    fn missing_service_disconnects_with_mismatch() {
        let mut session = Session::new(Role::Central);
        session.handle(SessionEvent::Start);
        session.handle(SessionEvent::AdvertisementMatched);
        session.handle(SessionEvent::ConnectSucceeded);
        session.handle(SessionEvent::DiscoveryStarted);

        match session.handle(SessionEvent::ServiceMissing) {
            SessionStep::Failed { error, .. } => {
                assert!(matches!(error, LinkError::ServiceMismatch(_)))
            }
            step => panic!("expected failure step, got {step:?}"),
        }
    }

    #[test]
    fn link_loss_invalidates_in_flight_tokens() {
        let mut session = Session::new(Role::Central);
        session.handle(SessionEvent::Start);
        session.handle(SessionEvent::AdvertisementMatched);
        session.handle(SessionEvent::ConnectSucceeded);
        let live = session.token();
        assert!(session.accepts(live));

        session.handle(SessionEvent::LinkLost);
        assert!(!session.accepts(live), "stale token must be rejected");
    }

    #[test]
    fn disconnected_can_restart_with_a_fresh_token() {
        let mut session = Session::new(Role::Central);
        session.handle(SessionEvent::Start);
        let first = session.token();
        session.handle(SessionEvent::AdvertisementMatched);
        session.handle(SessionEvent::ConnectFailed);

        step_to(&mut session, SessionEvent::Start, SessionPhase::Scanning);
        assert_ne!(session.token(), first);
    }

    #[test]
    fn events_outside_their_phase_are_ignored() {
        let mut session = Session::new(Role::Peripheral);
        assert_eq!(
            session.handle(SessionEvent::AdvertisementMatched),
            SessionStep::Ignored
        );
        assert_eq!(
            session.handle(SessionEvent::ServicesResolved),
            SessionStep::Ignored
        );
        assert_eq!(session.handle(SessionEvent::LinkLost), SessionStep::Ignored);
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn stop_releases_from_any_phase() {
        let mut session = Session::new(Role::Central);
        session.handle(SessionEvent::Start);
        session.handle(SessionEvent::AdvertisementMatched);
        step_to(&mut session, SessionEvent::Stop, SessionPhase::Idle);
        assert_eq!(session.handle(SessionEvent::Stop), SessionStep::Stayed);
    }
}
