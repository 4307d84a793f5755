//! Checkpoint quorum tracking.
//!
//! Replicas attest application state at every checkpoint boundary. Once
//! `2f+1` replicas agree on the value for a boundary — and the local replica
//! computed that same value — the checkpoint is *stable*: the log below it
//! is garbage and the watermarks move.

use multibft_types::{NodeId, SeqNo};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub(crate) struct CheckpointTracker {
    strong_quorum: usize,
    /// Highest stable checkpoint.
    stable: SeqNo,
    /// Our own attestations, per boundary.
    local: BTreeMap<SeqNo, Vec<u8>>,
    /// Attesting replicas per boundary per value.
    votes: BTreeMap<SeqNo, BTreeMap<Vec<u8>, BTreeSet<NodeId>>>,
}

impl CheckpointTracker {
    pub(crate) fn new(strong_quorum: usize, stable: SeqNo) -> Self {
        Self {
            strong_quorum,
            stable,
            local: BTreeMap::new(),
            votes: BTreeMap::new(),
        }
    }

    pub(crate) fn stable(&self) -> SeqNo {
        self.stable
    }

    /// Adopt an externally supplied stable checkpoint (state transfer).
    pub(crate) fn force_stable(&mut self, seq_no: SeqNo) {
        if seq_no > self.stable {
            self.stable = seq_no;
            self.local = self.local.split_off(&(seq_no + 1));
            self.votes = self.votes.split_off(&(seq_no + 1));
        }
    }

    /// Record our own checkpoint result. Returns the boundary if it became
    /// stable.
    pub(crate) fn note_local(
        &mut self,
        my_id: NodeId,
        seq_no: SeqNo,
        value: Vec<u8>,
    ) -> Option<SeqNo> {
        if seq_no <= self.stable {
            return None;
        }
        self.local.insert(seq_no, value.clone());
        self.note_vote(my_id, seq_no, value)
    }

    /// Record a remote checkpoint message. Returns the boundary if it became
    /// stable.
    pub(crate) fn apply_checkpoint_msg(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        value: Vec<u8>,
    ) -> Option<SeqNo> {
        if seq_no <= self.stable {
            return None;
        }
        self.note_vote(source, seq_no, value)
    }

    fn note_vote(&mut self, source: NodeId, seq_no: SeqNo, value: Vec<u8>) -> Option<SeqNo> {
        self.votes
            .entry(seq_no)
            .or_default()
            .entry(value)
            .or_default()
            .insert(source);
        self.check_stable(seq_no)
    }

    fn check_stable(&mut self, seq_no: SeqNo) -> Option<SeqNo> {
        let quorum_value = self
            .votes
            .get(&seq_no)?
            .iter()
            .find(|(_, voters)| voters.len() >= self.strong_quorum)?
            .0
            .clone();
        match self.local.get(&seq_no).cloned() {
            Some(local) if local == quorum_value => {
                debug!(seq_no, "checkpoint stable");
                self.stable = seq_no;
                self.local = self.local.split_off(&(seq_no + 1));
                self.votes = self.votes.split_off(&(seq_no + 1));
                Some(seq_no)
            }
            Some(_) => {
                // The network agreed on a value we did not compute. Not
                // locally fatal: we rejoin via state transfer.
                warn!(seq_no, "checkpoint value diverges from the network");
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stability_needs_quorum_and_local_agreement() {
        let mut t = CheckpointTracker::new(3, 0);
        assert_eq!(t.apply_checkpoint_msg(NodeId(1), 5, vec![1]), None);
        assert_eq!(t.apply_checkpoint_msg(NodeId(2), 5, vec![1]), None);
        // Quorum of remote votes alone is not enough without our value.
        assert_eq!(t.apply_checkpoint_msg(NodeId(3), 5, vec![1]), None);
        assert_eq!(t.note_local(NodeId(0), 5, vec![1]), Some(5));
        assert_eq!(t.stable(), 5);
    }

    #[test]
    fn divergent_local_value_is_not_fatal() {
        let mut t = CheckpointTracker::new(3, 0);
        t.note_local(NodeId(0), 5, vec![2]);
        t.apply_checkpoint_msg(NodeId(1), 5, vec![1]);
        t.apply_checkpoint_msg(NodeId(2), 5, vec![1]);
        assert_eq!(t.apply_checkpoint_msg(NodeId(3), 5, vec![1]), None);
        assert_eq!(t.stable(), 0);
    }

    #[test]
    fn stale_boundaries_are_ignored() {
        let mut t = CheckpointTracker::new(3, 10);
        assert_eq!(t.apply_checkpoint_msg(NodeId(1), 5, vec![1]), None);
        assert_eq!(t.note_local(NodeId(0), 10, vec![1]), None);
    }
}
