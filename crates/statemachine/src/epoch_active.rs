//! The active epoch: the window of in-flight sequences.
//!
//! Owns the sequence arena for the current epoch, routes protocol messages
//! to slots, drains the proposer into owned buckets, delivers commits in
//! contiguous order with checkpoint gating, and watches for stalls.

use crate::buckets::assign_buckets;
use crate::client::{AssignedRequest, ClientTracker};
use crate::outstanding::OutstandingRequests;
use crate::persisted::PersistedLog;
use crate::proposer::Proposer;
use crate::sequence::{Sequence, SequenceState};
use crate::status::BucketStatus;
use multibft_core::{Actions, Commit, InitialParameters};
use multibft_types::{
    BucketId, CEntry, Digest, EpochConfig, EpochNo, Msg, NetworkConfig, NetworkState, NodeId,
    QEntry, RequestAck, RequestData, SeqNo,
};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, trace, warn};

pub(crate) struct ActiveEpoch {
    config: EpochConfig,
    network: NetworkConfig,
    params: InitialParameters,
    buckets: BTreeMap<BucketId, NodeId>,
    sequences: VecDeque<Sequence>,
    proposer: Proposer,
    outstanding: OutstandingRequests,

    /// Set once the window tail reached the planned expiration; no further
    /// slots are appended.
    ending: bool,
    /// Set once we broadcast a suspect for this epoch.
    suspicious: bool,

    /// Offset of the first undelivered slot.
    lowest_uncommitted: usize,
    /// Per bucket, offset of the first unallocated slot.
    lowest_unallocated: BTreeMap<BucketId, usize>,

    /// Highest contiguously delivered sequence number.
    last_committed: SeqNo,
    /// A checkpoint commit was delivered and its result is outstanding; no
    /// later commit is delivered until it arrives.
    pending_checkpoint: Option<SeqNo>,

    last_committed_at_tick: SeqNo,
    ticks_since_progress: u32,
}

impl ActiveEpoch {
    /// Reconstruct the epoch from the persisted log: start at the latest
    /// checkpoint, re-adopt every batch record above it, and re-broadcast
    /// the messages our recovered states imply.
    pub(crate) fn new(
        persisted: &mut PersistedLog,
        clients: &mut ClientTracker,
        params: &InitialParameters,
    ) -> (Self, Actions) {
        let base = persisted
            .latest_c_entry()
            .expect("persisted log has no base checkpoint")
            .clone();
        let config = persisted
            .latest_epoch_config()
            .expect("persisted log has no epoch configuration")
            .clone();
        let network = base.network_state.config.clone();
        let buckets = assign_buckets(&config, &network);
        let strong_quorum = network.strong_quorum();

        let width = network
            .log_width()
            .min(config.planned_expiration.saturating_sub(base.seq_no));
        let mut sequences = VecDeque::with_capacity(width as usize);
        for i in 0..width {
            let seq_no = base.seq_no + i + 1;
            let owner = buckets[&network.seq_to_bucket(seq_no)];
            sequences.push_back(Sequence::new(
                seq_no,
                config.number,
                owner,
                params.id,
                strong_quorum,
            ));
        }
        let ending = base.seq_no + network.log_width() >= config.planned_expiration;

        let mut lowest_unallocated = BTreeMap::new();
        for i in 0..network.number_of_buckets {
            let bucket = network.seq_to_bucket(base.seq_no + i + 1);
            lowest_unallocated.insert(bucket, i as usize);
        }

        let mut epoch = Self {
            proposer: Proposer::new(
                base.seq_no,
                params.batch_size as usize,
                &network,
                &buckets,
                clients,
                params.id,
            ),
            config,
            network,
            params: params.clone(),
            buckets,
            sequences,
            outstanding: OutstandingRequests::default(),
            ending,
            suspicious: false,
            lowest_uncommitted: 0,
            lowest_unallocated,
            last_committed: persisted.last_committed().max(base.seq_no),
            pending_checkpoint: None,
            last_committed_at_tick: 0,
            ticks_since_progress: 0,
        };

        let actions = epoch.replay(&base, persisted, clients);
        (epoch, actions)
    }

    /// Re-adopt batch records above the base checkpoint.
    fn replay(
        &mut self,
        base: &CEntry,
        persisted: &mut PersistedLog,
        clients: &mut ClientTracker,
    ) -> Actions {
        let last_committed = persisted.last_committed();
        let q_entries: Vec<QEntry> = persisted.q_entries_above(base.seq_no).cloned().collect();
        let p_entries: Vec<(SeqNo, EpochNo)> = persisted
            .p_entries_above(base.seq_no)
            .map(|p| (p.seq_no, p.epoch))
            .collect();

        let mut actions = Actions::default();
        for q_entry in q_entries {
            let offset = (q_entry.seq_no - base.seq_no - 1) as usize;
            if offset >= self.sequences.len() {
                panic!(
                    "batch record at {} outside the log window starting at {}",
                    q_entry.seq_no, base.seq_no
                );
            }
            let bucket = self.network.seq_to_bucket(q_entry.seq_no);
            let unallocated = self.lowest_unallocated.get_mut(&bucket).unwrap();
            *unallocated = (*unallocated).max(offset + self.buckets.len());
            clients.note_recovered_batch(q_entry.seq_no, &q_entry.requests);

            let adopted = QEntry {
                epoch: self.config.number,
                ..q_entry.clone()
            };
            if q_entry.epoch != self.config.number {
                // Re-driven under the new epoch; record it as such.
                actions.append(persisted.add_q_entry(adopted.clone()));
            }
            self.sequences[offset].recover_preprepared(adopted);
        }

        for (seq_no, _epoch) in p_entries {
            let offset = (seq_no - base.seq_no - 1) as usize;
            if offset >= self.sequences.len() {
                panic!(
                    "prepare record at {seq_no} outside the log window starting at {}",
                    base.seq_no
                );
            }
            let seq = &mut self.sequences[offset];
            if seq.state() < SequenceState::Preprepared {
                warn!(seq_no, "prepare record without a batch record, skipping");
                continue;
            }
            if last_committed >= seq_no {
                seq.recover_committed();
            } else {
                seq.recover_prepared();
            }
        }

        self.lowest_uncommitted =
            (last_committed.max(base.seq_no) - base.seq_no) as usize;

        for seq in &self.sequences {
            match seq.state() {
                SequenceState::Preprepared => actions.send(Msg::Prepare {
                    seq_no: seq.seq_no(),
                    epoch: self.config.number,
                    digest: seq.digest().cloned().unwrap(),
                }),
                SequenceState::Prepared => actions.send(Msg::Commit {
                    seq_no: seq.seq_no(),
                    epoch: self.config.number,
                    digest: seq.digest().cloned().unwrap(),
                }),
                _ => {}
            }
        }
        actions
    }

    pub(crate) fn epoch_no(&self) -> EpochNo {
        self.config.number
    }

    pub(crate) fn config(&self) -> &EpochConfig {
        &self.config
    }

    pub(crate) fn low_watermark(&self) -> SeqNo {
        self.sequences.front().map(|s| s.seq_no()).unwrap_or(0)
    }

    pub(crate) fn high_watermark(&self) -> SeqNo {
        self.sequences.back().map(|s| s.seq_no()).unwrap_or(0)
    }

    pub(crate) fn last_committed(&self) -> SeqNo {
        self.last_committed
    }

    pub(crate) fn suspicious(&self) -> bool {
        self.suspicious
    }

    /// Note that a suspect for this epoch has already been persisted.
    pub(crate) fn mark_suspicious(&mut self) {
        self.suspicious = true;
    }

    /// The epoch reached its planned expiration with every slot delivered.
    pub(crate) fn is_done(&self) -> bool {
        self.ending
            && self.pending_checkpoint.is_none()
            && self.lowest_uncommitted >= self.sequences.len()
    }

    fn seq_index(&self, seq_no: SeqNo) -> Option<usize> {
        let low = self.low_watermark();
        if seq_no < low || seq_no > self.high_watermark() {
            return None;
        }
        Some((seq_no - low) as usize)
    }

    // ── Message routing ─────────────────────────────────────────────────────

    pub(crate) fn apply_preprepare_msg(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        batch: Vec<RequestAck>,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let Some(offset) = self.seq_index(seq_no) else {
            debug!(seq_no, %source, "preprepare outside the watermarks");
            return Actions::default();
        };
        if self.sequences[offset].state() != SequenceState::Uninitialized {
            trace!(seq_no, %source, "duplicate preprepare");
            return Actions::default();
        }
        let owner = self.sequences[offset].owner();
        if source != owner {
            warn!(seq_no, %source, %owner, "preprepare from a non-owner");
            return self.suspect(persisted);
        }

        let bucket = self.network.seq_to_bucket(seq_no);
        let expected = self.lowest_unallocated[&bucket];
        if offset != expected {
            warn!(
                seq_no,
                %bucket,
                offset,
                expected,
                "preprepare skips unallocated slots, suspecting bucket"
            );
            return self.suspect(persisted);
        }

        let admitted = match self.outstanding.admit_batch(
            source,
            seq_no,
            bucket,
            &batch,
            &self.network,
            clients,
        ) {
            Ok(admitted) => admitted,
            Err(()) => return self.suspect(persisted),
        };

        *self.lowest_unallocated.get_mut(&bucket).unwrap() += self.buckets.len();
        for ack in &batch {
            clients.mark_allocated(ack.client_id, ack.req_no, seq_no);
        }

        let mut actions = self.sequences[offset].allocate_from_preprepare(
            batch,
            admitted.resolved,
            admitted.missing,
        );
        actions.append(admitted.fetches);
        actions
    }

    pub(crate) fn apply_prepare_msg(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        digest: Digest,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let Some(offset) = self.seq_index(seq_no) else {
            debug!(seq_no, %source, "prepare outside the watermarks");
            return Actions::default();
        };
        let mut actions = self.sequences[offset].apply_prepare_msg(source, digest, persisted);
        actions.append(self.drain_commits(clients, persisted));
        actions
    }

    pub(crate) fn apply_commit_msg(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        digest: Digest,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let Some(offset) = self.seq_index(seq_no) else {
            debug!(seq_no, %source, "commit outside the watermarks");
            return Actions::default();
        };
        let mut actions = self.sequences[offset].apply_commit_msg(source, digest, persisted);
        actions.append(self.drain_commits(clients, persisted));
        actions
    }

    pub(crate) fn apply_batch_hash_result(
        &mut self,
        seq_no: SeqNo,
        digest: Digest,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let Some(offset) = self.seq_index(seq_no) else {
            debug!(seq_no, "batch hash result outside the watermarks");
            return Actions::default();
        };
        let mut actions = self.sequences[offset].apply_batch_hash_result(digest, persisted);
        actions.append(self.drain_commits(clients, persisted));
        actions
    }

    /// A request payload referenced by a pending preprepare became
    /// available.
    pub(crate) fn resolve_request(
        &mut self,
        data: &RequestData,
        digest: &Digest,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let waiting = self
            .outstanding
            .satisfy(data.client_id, data.req_no, digest);
        let mut actions = Actions::default();
        for seq_no in waiting {
            if let Some(offset) = self.seq_index(seq_no) {
                actions.append(self.sequences[offset].satisfy_request(data.clone()));
            }
        }
        actions.append(self.drain_commits(clients, persisted));
        actions
    }

    /// Whether any pending preprepare is still waiting for this request.
    pub(crate) fn needs_request(&self, client_id: u64, req_no: u64) -> bool {
        self.outstanding.is_missing(client_id, req_no)
    }

    // ── Commit delivery ─────────────────────────────────────────────────────

    /// Deliver newly contiguous committed slots, stopping at a checkpoint
    /// boundary until its result is supplied.
    fn drain_commits(
        &mut self,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let mut actions = Actions::default();
        if self.pending_checkpoint.is_some() {
            return actions;
        }
        while self.lowest_uncommitted < self.sequences.len() {
            let seq = &self.sequences[self.lowest_uncommitted];
            if !seq.is_committed() {
                break;
            }
            let q_entry = seq
                .q_entry()
                .expect("committed sequence without a batch record")
                .clone();
            let checkpoint = q_entry.seq_no % self.network.checkpoint_interval == 0;
            for request in &q_entry.requests {
                clients.mark_committed(request.client_id, request.req_no, q_entry.seq_no);
            }
            self.last_committed = q_entry.seq_no;
            persisted.set_last_committed(q_entry.seq_no);
            self.lowest_uncommitted += 1;
            info!(
                seq_no = q_entry.seq_no,
                epoch = self.config.number,
                checkpoint,
                "delivering commit"
            );
            actions.commits.push(Commit {
                q_entry,
                checkpoint,
                epoch_config: self.config.clone(),
            });
            if checkpoint {
                self.pending_checkpoint = Some(self.last_committed);
                break;
            }
        }
        actions
    }

    /// The caller attested the application state at a checkpoint boundary:
    /// persist it, tell the network, and resume commit delivery.
    pub(crate) fn apply_checkpoint_result(
        &mut self,
        seq_no: SeqNo,
        value: Vec<u8>,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        match self.pending_checkpoint {
            Some(pending) if pending == seq_no => self.pending_checkpoint = None,
            _ => {
                debug!(seq_no, "unsolicited checkpoint result");
                return Actions::default();
            }
        }
        let c_entry = CEntry {
            seq_no,
            value: value.clone(),
            network_state: NetworkState {
                config: self.network.clone(),
                clients: clients.client_ids(),
            },
            epoch_config: self.config.clone(),
        };
        let mut actions = persisted.add_c_entry(c_entry);
        actions.send(Msg::Checkpoint { seq_no, value });
        actions.append(self.drain_commits(clients, persisted));
        actions
    }

    /// Drop slots covered by a stable checkpoint and grow the tail, then
    /// give the proposer the room that opened up.
    pub(crate) fn move_watermarks(
        &mut self,
        stable: SeqNo,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        while let Some(front) = self.sequences.front() {
            if front.seq_no() > stable {
                break;
            }
            if !front.is_committed() {
                // Only possible when the checkpoint came via state
                // transfer; the in-flight slot is superseded.
                debug!(seq_no = front.seq_no(), "dropping slot below a stable checkpoint");
            }
            self.sequences.pop_front();
            for unallocated in self.lowest_unallocated.values_mut() {
                *unallocated = unallocated.saturating_sub(1);
            }
            self.lowest_uncommitted = self.lowest_uncommitted.saturating_sub(1);

            if self.ending {
                continue;
            }
            let next_seq = match self.sequences.back() {
                Some(back) => back.seq_no() + 1,
                None => stable + 1,
            };
            let owner = self.buckets[&self.network.seq_to_bucket(next_seq)];
            self.sequences.push_back(Sequence::new(
                next_seq,
                self.config.number,
                owner,
                self.params.id,
                self.network.strong_quorum(),
            ));
            if next_seq == self.config.planned_expiration {
                info!(epoch = self.config.number, next_seq, "epoch window reached planned expiration");
                self.ending = true;
            }
        }

        let mut actions = self.drain_commits(clients, persisted);
        actions.append(self.drain_proposer(clients));
        actions
    }

    // ── Proposal ────────────────────────────────────────────────────────────

    /// Allocate full batches into owned buckets while room remains. The last
    /// checkpoint interval of the window is left unfilled so the network can
    /// move the watermarks first, unless the epoch is ending.
    pub(crate) fn drain_proposer(&mut self, clients: &mut ClientTracker) -> Actions {
        self.proposer.advance_ready(clients);
        let my_id = self.params.id;
        let owned: Vec<BucketId> = self
            .buckets
            .iter()
            .filter(|(_, owner)| **owner == my_id)
            .map(|(bucket, _)| *bucket)
            .collect();

        let mut actions = Actions::default();
        for bucket in owned {
            loop {
                let offset = self.lowest_unallocated[&bucket];
                if offset >= self.sequences.len() {
                    break;
                }
                if self.sequences.len() - offset <= self.network.checkpoint_interval as usize
                    && !self.ending
                {
                    break;
                }
                let seq_no = self.sequences[offset].seq_no();
                let full = self
                    .proposer
                    .bucket_mut(bucket)
                    .is_some_and(|prb| prb.has_pending(seq_no));
                if !full {
                    break;
                }
                let batch = self.proposer.bucket_mut(bucket).unwrap().next_batch();
                actions.append(self.allocate_owned(bucket, offset, batch, clients));
            }
        }
        actions
    }

    fn allocate_owned(
        &mut self,
        bucket: BucketId,
        offset: usize,
        batch: Vec<AssignedRequest>,
        clients: &mut ClientTracker,
    ) -> Actions {
        let seq_no = self.sequences[offset].seq_no();
        for request in &batch {
            clients.mark_allocated(request.data.client_id, request.data.req_no, seq_no);
        }
        *self.lowest_unallocated.get_mut(&bucket).unwrap() += self.buckets.len();
        self.sequences[offset].allocate_as_owner(batch)
    }

    // ── Ticks ───────────────────────────────────────────────────────────────

    /// Stall detection and heartbeats.
    ///
    /// Without commit progress the stall counter grows; past `suspect_ticks`
    /// we tell the network the epoch has stalled. At every heartbeat
    /// multiple we flush short batches, and allocate empty batches into idle
    /// owned buckets that trail the most advanced bucket so contiguous
    /// delivery is not held up by a quiet bucket.
    pub(crate) fn tick(
        &mut self,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        if self.last_committed_at_tick < self.last_committed {
            self.last_committed_at_tick = self.last_committed;
            self.ticks_since_progress = 0;
            return Actions::default();
        }
        self.ticks_since_progress += 1;

        let mut actions = Actions::default();
        if self.ticks_since_progress > self.params.suspect_ticks {
            warn!(
                epoch = self.config.number,
                ticks = self.ticks_since_progress,
                "no commit progress, suspecting epoch"
            );
            actions.append(self.suspect(persisted));
        }

        if self.params.heartbeat_ticks == 0
            || self.ticks_since_progress % self.params.heartbeat_ticks != 0
        {
            return actions;
        }

        self.proposer.advance_ready(clients);
        let my_id = self.params.id;
        let owned: Vec<BucketId> = self
            .buckets
            .iter()
            .filter(|(_, owner)| **owner == my_id)
            .map(|(bucket, _)| *bucket)
            .collect();
        let most_advanced = self
            .lowest_unallocated
            .values()
            .copied()
            .max()
            .unwrap_or(0);

        for bucket in owned {
            let offset = self.lowest_unallocated[&bucket];
            if offset >= self.sequences.len() {
                continue;
            }
            if self.sequences.len() - offset <= self.network.checkpoint_interval as usize
                && !self.ending
            {
                continue;
            }
            let seq_no = self.sequences[offset].seq_no();
            let outstanding = self
                .proposer
                .bucket_mut(bucket)
                .is_some_and(|prb| prb.has_outstanding(seq_no));
            let batch = if outstanding {
                self.proposer.bucket_mut(bucket).unwrap().next_batch()
            } else if offset < most_advanced {
                Vec::new()
            } else {
                continue;
            };
            debug!(%bucket, seq_no, requests = batch.len(), "heartbeat allocation");
            actions.append(self.allocate_owned(bucket, offset, batch, clients));
        }
        actions
    }

    /// Broadcast (and persist, once) that this epoch misbehaved or stalled.
    pub(crate) fn suspect(&mut self, persisted: &mut PersistedLog) -> Actions {
        let mut actions = Actions::default();
        actions.send(Msg::Suspect {
            epoch: self.config.number,
        });
        if !self.suspicious {
            self.suspicious = true;
            actions.append(persisted.add_suspect(self.config.number));
        }
        actions
    }

    pub(crate) fn status(&self) -> Vec<BucketStatus> {
        self.buckets
            .iter()
            .map(|(bucket, owner)| {
                let sequences = self
                    .sequences
                    .iter()
                    .filter(|s| self.network.seq_to_bucket(s.seq_no()) == *bucket)
                    .map(|s| s.state())
                    .collect();
                BucketStatus {
                    id: bucket.0,
                    owner: owner.0,
                    leader: *owner == self.params.id,
                    sequences,
                }
            })
            .collect()
    }
}
