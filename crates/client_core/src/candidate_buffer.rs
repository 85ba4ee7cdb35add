use std::collections::VecDeque;

use shared::protocol::IceCandidate;

/// Candidates waiting on the other half of the negotiation: remote ones until
/// a remote description is applied, local ones until our offer is sent.
/// Append-only until drained; drained strictly front to back.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn pop_front(&mut self) -> Option<IceCandidate> {
        self.pending.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
