//! In-memory loopback simulation of the counter link.
//!
//! Couples a peripheral and a central through their mock radios so whole
//! sessions run deterministically in-process, with no hardware and no real
//! time.

pub mod harness;

pub use harness::LinkHarness;
