//! Pending request/response ledger.
//!
//! Each read/write exchange is logically request-then-single-response even
//! though the transport is fire-and-forget. The ledger correlates inbound
//! or outbound requests with their eventual answer and enforces the
//! answered-exactly-once rule; unanswered entries surface as timeouts.

use std::collections::HashMap;

use tally_core::{PeerId, RequestId};

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    expiry_step: u64,
}

/// Ledger of open exchanges keyed by peer identity plus transport request id.
#[derive(Debug, Default)]
pub struct PendingLedger {
    entries: HashMap<(PeerId, RequestId), PendingRequest>,
}

impl PendingLedger {
    /// Opens an exchange. Returns `false` if the same (peer, request) pair is
    /// already in flight, which would indicate a transport-level replay.
    pub fn open(
        &mut self,
        peer: PeerId,
        request: RequestId,
        now_step: u64,
        timeout_steps: u64,
    ) -> bool {
        let expiry_step = now_step.saturating_add(timeout_steps);
        self.entries
            .insert((peer, request), PendingRequest { expiry_step })
            .is_none()
    }

    /// Settles an exchange. Returns `true` if it was open; `false` means a
    /// duplicate or unknown answer, which the caller must drop rather than
    /// deliver twice.
    pub fn settle(&mut self, peer: &PeerId, request: RequestId) -> bool {
        self.entries.remove(&(peer.clone(), request)).is_some()
    }

    /// Removes and returns every exchange whose window has passed.
    pub fn expire_due(&mut self, now_step: u64) -> Vec<(PeerId, RequestId)> {
        let due: Vec<(PeerId, RequestId)> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.expiry_step <= now_step)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.entries.remove(key);
        }
        due
    }

    /// Drops every open exchange for a departed peer. The remote stack that
    /// was waiting no longer exists, so nothing times out for it either.
    pub fn drop_peer(&mut self, peer: &PeerId) {
        self.entries.retain(|(entry_peer, _), _| entry_peer != peer);
    }

    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }
}
