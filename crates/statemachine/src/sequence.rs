//! The three-phase state machine for a single log slot.
//!
//! A sequence moves strictly forward through its states. Prepares and
//! commits are recorded per digest per source: messages carrying a digest
//! other than the bound one accumulate under their own key and never count
//! toward the bound quorum, and messages arriving before the digest is known
//! are held the same way and re-evaluated once the digest is assigned.

use crate::client::AssignedRequest;
use crate::persisted::PersistedLog;
use multibft_core::{Actions, Batch};
use multibft_types::{
    ClientId, Digest, EpochNo, Msg, NodeId, PEntry, QEntry, ReqNo, RequestAck, RequestData, SeqNo,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// Lifecycle of one log slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SequenceState {
    /// No batch assigned yet.
    Uninitialized,
    /// Batch assigned, all request payloads present, batch digest requested.
    Allocated,
    /// Batch assigned but some request payloads are still being fetched.
    PendingRequests,
    /// Digest bound, QEntry persistence requested, prepare broadcast.
    Preprepared,
    /// Prepare quorum reached, PEntry persistence requested, commit broadcast.
    Prepared,
    /// Commit quorum reached; awaiting contiguous delivery.
    Committed,
}

pub(crate) struct Sequence {
    seq_no: SeqNo,
    epoch: EpochNo,
    owner: NodeId,
    my_id: NodeId,
    strong_quorum: usize,
    state: SequenceState,
    digest: Option<Digest>,
    /// The allocated batch, in proposal order.
    batch: Vec<RequestAck>,
    /// Resolved request payloads, keyed by `(client_id, req_no)`.
    resolved: BTreeMap<(ClientId, ReqNo), RequestData>,
    /// Requests from `batch` whose payloads are still missing.
    missing: BTreeSet<(ClientId, ReqNo)>,
    /// Prepare senders, per digest. Only the bound digest's set counts.
    prepares: BTreeMap<Digest, BTreeSet<NodeId>>,
    /// Commit senders, per digest.
    commits: BTreeMap<Digest, BTreeSet<NodeId>>,
    q_entry: Option<QEntry>,
}

impl Sequence {
    pub(crate) fn new(
        seq_no: SeqNo,
        epoch: EpochNo,
        owner: NodeId,
        my_id: NodeId,
        strong_quorum: usize,
    ) -> Self {
        Self {
            seq_no,
            epoch,
            owner,
            my_id,
            strong_quorum,
            state: SequenceState::Uninitialized,
            digest: None,
            batch: Vec::new(),
            resolved: BTreeMap::new(),
            missing: BTreeSet::new(),
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            q_entry: None,
        }
    }

    pub(crate) fn seq_no(&self) -> SeqNo {
        self.seq_no
    }

    pub(crate) fn owner(&self) -> NodeId {
        self.owner
    }

    pub(crate) fn state(&self) -> SequenceState {
        self.state
    }

    pub(crate) fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub(crate) fn q_entry(&self) -> Option<&QEntry> {
        self.q_entry.as_ref()
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.state == SequenceState::Committed
    }

    /// Assign a batch to this slot as its owner. Emits the preprepare
    /// broadcast and requests the batch digest.
    pub(crate) fn allocate_as_owner(&mut self, requests: Vec<AssignedRequest>) -> Actions {
        if self.state != SequenceState::Uninitialized {
            panic!(
                "allocating sequence {} as owner in state {:?}",
                self.seq_no, self.state
            );
        }

        for req in &requests {
            self.resolved
                .insert((req.data.client_id, req.data.req_no), req.data.clone());
        }
        self.batch = requests.into_iter().map(|r| r.ack).collect();
        self.state = SequenceState::Allocated;

        trace!(
            seq_no = self.seq_no,
            epoch = self.epoch,
            requests = self.batch.len(),
            "allocated sequence as owner"
        );

        let mut actions = Actions::default();
        actions.send(Msg::Preprepare {
            seq_no: self.seq_no,
            epoch: self.epoch,
            batch: self.batch.clone(),
        });
        actions.process.push(self.batch_to_hash());
        actions
    }

    /// Assign a batch received in a preprepare from the slot's owner.
    ///
    /// `resolved` holds the payloads already known locally, `missing` the
    /// ones the outstanding-request tracker is fetching. The batch digest is
    /// requested as soon as nothing is missing.
    pub(crate) fn allocate_from_preprepare(
        &mut self,
        batch: Vec<RequestAck>,
        resolved: BTreeMap<(ClientId, ReqNo), RequestData>,
        missing: BTreeSet<(ClientId, ReqNo)>,
    ) -> Actions {
        if self.state != SequenceState::Uninitialized {
            panic!(
                "allocating sequence {} from preprepare in state {:?}",
                self.seq_no, self.state
            );
        }

        self.batch = batch;
        self.resolved = resolved;
        self.missing = missing;

        let mut actions = Actions::default();
        if self.missing.is_empty() {
            self.state = SequenceState::Allocated;
            actions.process.push(self.batch_to_hash());
        } else {
            debug!(
                seq_no = self.seq_no,
                missing = self.missing.len(),
                "preprepare references unknown requests"
            );
            self.state = SequenceState::PendingRequests;
        }
        actions
    }

    /// A previously missing request payload became available.
    pub(crate) fn satisfy_request(&mut self, data: RequestData) -> Actions {
        let key = (data.client_id, data.req_no);
        if self.state != SequenceState::PendingRequests || !self.missing.remove(&key) {
            return Actions::default();
        }
        self.resolved.insert(key, data);

        let mut actions = Actions::default();
        if self.missing.is_empty() {
            self.state = SequenceState::Allocated;
            actions.process.push(self.batch_to_hash());
        }
        actions
    }

    /// The caller finished hashing the batch: bind the digest, persist the
    /// QEntry and broadcast our prepare.
    pub(crate) fn apply_batch_hash_result(
        &mut self,
        digest: Digest,
        persisted: &mut PersistedLog,
    ) -> Actions {
        if self.state != SequenceState::Allocated {
            debug!(
                seq_no = self.seq_no,
                state = ?self.state,
                "dropping stale batch hash result"
            );
            return Actions::default();
        }

        let q_entry = QEntry {
            seq_no: self.seq_no,
            epoch: self.epoch,
            digest: digest.clone(),
            requests: self.ordered_requests(),
        };
        self.digest = Some(digest.clone());
        self.q_entry = Some(q_entry.clone());
        self.state = SequenceState::Preprepared;

        let mut actions = persisted.add_q_entry(q_entry);
        actions.send(Msg::Prepare {
            seq_no: self.seq_no,
            epoch: self.epoch,
            digest: digest.clone(),
        });
        self.record_prepare(self.my_id, digest);
        actions.append(self.advance_state(persisted));
        actions
    }

    /// Record a prepare from `source`. Duplicates are idempotent.
    pub(crate) fn apply_prepare_msg(
        &mut self,
        source: NodeId,
        digest: Digest,
        persisted: &mut PersistedLog,
    ) -> Actions {
        if !self.record_prepare(source, digest) {
            trace!(seq_no = self.seq_no, %source, "duplicate prepare");
            return Actions::default();
        }
        self.advance_state(persisted)
    }

    /// Record a commit from `source`. Duplicates are idempotent.
    pub(crate) fn apply_commit_msg(
        &mut self,
        source: NodeId,
        digest: Digest,
        persisted: &mut PersistedLog,
    ) -> Actions {
        if !self.record_commit(source, digest) {
            trace!(seq_no = self.seq_no, %source, "duplicate commit");
            return Actions::default();
        }
        self.advance_state(persisted)
    }

    // ── Recovery ────────────────────────────────────────────────────────────

    /// Restore a slot to Preprepared from a replayed QEntry.
    pub(crate) fn recover_preprepared(&mut self, q_entry: QEntry) {
        for r in &q_entry.requests {
            self.resolved.insert((r.client_id, r.req_no), r.clone());
        }
        // Per-request digests are not stored in the record; the batch
        // digest stands in, and recovered acks are only consulted for
        // identity.
        self.batch = q_entry
            .requests
            .iter()
            .map(|r| r.ack(q_entry.digest.clone()))
            .collect();
        self.digest = Some(q_entry.digest.clone());
        self.q_entry = Some(q_entry);
        self.state = SequenceState::Preprepared;
        let digest = self.digest.clone().unwrap();
        self.record_prepare(self.my_id, digest);
    }

    /// Advance a recovered slot to Prepared (a PEntry was replayed).
    pub(crate) fn recover_prepared(&mut self) {
        if self.state < SequenceState::Preprepared {
            panic!(
                "recovering sequence {} to prepared from {:?}",
                self.seq_no, self.state
            );
        }
        self.state = SequenceState::Prepared;
        if let Some(digest) = self.digest.clone() {
            self.record_commit(self.my_id, digest);
        }
    }

    /// Advance a recovered slot to Committed (covered by the last-committed
    /// pointer).
    pub(crate) fn recover_committed(&mut self) {
        self.recover_prepared();
        self.state = SequenceState::Committed;
    }

    // ── Internal ────────────────────────────────────────────────────────────

    fn batch_to_hash(&self) -> Batch {
        Batch {
            source: self.owner,
            seq_no: self.seq_no,
            epoch: self.epoch,
            requests: self.ordered_requests(),
        }
    }

    /// Payloads in batch order.
    fn ordered_requests(&self) -> Vec<RequestData> {
        self.batch
            .iter()
            .map(|ack| {
                self.resolved
                    .get(&(ack.client_id, ack.req_no))
                    .cloned()
                    .unwrap_or_else(|| {
                        panic!(
                            "request ({}, {}) missing from resolved set of sequence {}",
                            ack.client_id, ack.req_no, self.seq_no
                        )
                    })
            })
            .collect()
    }

    fn record_prepare(&mut self, source: NodeId, digest: Digest) -> bool {
        if let Some(bound) = &self.digest {
            if *bound != digest {
                warn!(
                    seq_no = self.seq_no,
                    %source,
                    ?digest,
                    "prepare digest conflicts with bound digest"
                );
            }
        }
        self.prepares.entry(digest).or_default().insert(source)
    }

    fn record_commit(&mut self, source: NodeId, digest: Digest) -> bool {
        if let Some(bound) = &self.digest {
            if *bound != digest {
                warn!(
                    seq_no = self.seq_no,
                    %source,
                    ?digest,
                    "commit digest conflicts with bound digest"
                );
            }
        }
        self.commits.entry(digest).or_default().insert(source)
    }

    /// A prepare quorum needs `2f+1` distinct senders for the bound digest,
    /// the owner among them.
    fn prepare_quorum(&self) -> bool {
        let Some(digest) = &self.digest else {
            return false;
        };
        self.prepares
            .get(digest)
            .is_some_and(|set| set.len() >= self.strong_quorum && set.contains(&self.owner))
    }

    fn commit_quorum(&self) -> bool {
        let Some(digest) = &self.digest else {
            return false;
        };
        self.commits
            .get(digest)
            .is_some_and(|set| set.len() >= self.strong_quorum)
    }

    /// Move forward as far as recorded messages allow.
    fn advance_state(&mut self, persisted: &mut PersistedLog) -> Actions {
        let mut actions = Actions::default();

        if self.state == SequenceState::Preprepared && self.prepare_quorum() {
            let digest = self.digest.clone().unwrap();
            self.state = SequenceState::Prepared;
            actions.append(persisted.add_p_entry(PEntry {
                seq_no: self.seq_no,
                epoch: self.epoch,
                digest: digest.clone(),
            }));
            actions.send(Msg::Commit {
                seq_no: self.seq_no,
                epoch: self.epoch,
                digest: digest.clone(),
            });
            self.record_commit(self.my_id, digest);
        }

        if self.state == SequenceState::Prepared && self.commit_quorum() {
            self.state = SequenceState::Committed;
            debug!(seq_no = self.seq_no, epoch = self.epoch, "sequence committed");
        }

        actions
    }
}
