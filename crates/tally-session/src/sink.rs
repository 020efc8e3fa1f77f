//! Presentation collaborator surface.
//!
//! The core pushes counter values and lifecycle changes into a sink; it never
//! pulls, and the sink never calls back into the endpoint.

use crate::machine::SessionPhase;

/// Observable sink for counter and connection-status updates.
pub trait StatusSink {
    /// Called after every counter mutation on the peripheral, and for every
    /// decoded counter notification on the central.
    fn counter_changed(&mut self, value: u32);

    /// Called on every session phase transition.
    fn phase_changed(&mut self, phase: SessionPhase);

    /// Called when the number of notification subscribers changes
    /// (peripheral only).
    fn subscribers_changed(&mut self, _count: usize) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn counter_changed(&mut self, _value: u32) {}
    fn phase_changed(&mut self, _phase: SessionPhase) {}
}

/// Sink that records every push, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub counters: Vec<u32>,
    pub phases: Vec<SessionPhase>,
    pub subscriber_counts: Vec<usize>,
}

impl StatusSink for RecordingSink {
    fn counter_changed(&mut self, value: u32) {
        self.counters.push(value);
    }

    fn phase_changed(&mut self, phase: SessionPhase) {
        self.phases.push(phase);
    }

    fn subscribers_changed(&mut self, count: usize) {
        self.subscriber_counts.push(count);
    }
}
