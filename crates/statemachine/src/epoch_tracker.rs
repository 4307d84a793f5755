//! Epoch lifecycle: suspicion, epoch change, activation.
//!
//! Suspicions accumulate per epoch: a weak quorum makes us join, a strong
//! quorum makes every replica give up on the epoch and broadcast its
//! `EpochChange` for the successor. The successor's primary assembles a
//! `NewEpoch` proposal from `2f+1` changes; replicas confirm it with an
//! echo round and a ready round (with weak-quorum amplification) before
//! persisting `NewEpochStart` and activating the new window. Epochs that
//! reach their planned expiration roll over without any of this.

use crate::client::ClientTracker;
use crate::epoch_active::ActiveEpoch;
use crate::persisted::PersistedLog;
use crate::status::EpochPhase;
use multibft_core::{Actions, InitialParameters};
use multibft_types::{
    EntryRef, EpochChange, EpochConfig, EpochNo, Msg, NetworkConfig, NewEpoch, NodeId, SeqNo,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct EpochTarget {
    /// Replicas that suspect this epoch.
    suspicions: BTreeSet<NodeId>,
    /// Epoch-change contributions for this epoch, by sender.
    changes: BTreeMap<NodeId, EpochChange>,
    /// Ack senders per change originator.
    acks: BTreeMap<NodeId, BTreeSet<NodeId>>,
    /// The accepted new-epoch proposal.
    new_epoch: Option<NewEpoch>,
    echoes: BTreeSet<NodeId>,
    readies: BTreeSet<NodeId>,
    change_broadcast: bool,
    new_epoch_broadcast: bool,
    echo_broadcast: bool,
    ready_broadcast: bool,
}

pub(crate) struct EpochTracker {
    params: InitialParameters,
    network: NetworkConfig,
    /// The active window, absent while an epoch change is pending.
    active: Option<ActiveEpoch>,
    /// Number of the active epoch, or of the pending target.
    current_epoch: EpochNo,
    targets: BTreeMap<EpochNo, EpochTarget>,
    pending_ticks: u32,
}

impl EpochTracker {
    /// Reconstruct from the persisted log. A log whose newest epoch record
    /// is an unresolved `EpochChange` resumes mid-change: the change is
    /// re-broadcast and no window is active until the epoch starts.
    pub(crate) fn new(
        network: NetworkConfig,
        persisted: &mut PersistedLog,
        clients: &mut ClientTracker,
        params: &InitialParameters,
    ) -> (Self, Actions) {
        let mut tracker = Self {
            params: params.clone(),
            network,
            active: None,
            current_epoch: 0,
            targets: BTreeMap::new(),
            pending_ticks: 0,
        };

        let mut actions = Actions::default();
        if let Some(change) = persisted.pending_epoch_change().cloned() {
            info!(
                epoch = change.new_epoch,
                "resuming with an unresolved epoch change"
            );
            tracker.current_epoch = change.new_epoch;
            actions.send(Msg::EpochChange(change.clone()));
            let target = tracker.targets.entry(change.new_epoch).or_default();
            target.change_broadcast = true;
            target.changes.insert(params.id, change);
        } else {
            let (epoch, recovery) = ActiveEpoch::new(persisted, clients, params);
            tracker.current_epoch = epoch.epoch_no();
            tracker.active = Some(epoch);
            actions.append(recovery);
        }
        (tracker, actions)
    }

    pub(crate) fn active(&self) -> Option<&ActiveEpoch> {
        self.active.as_ref()
    }

    pub(crate) fn active_mut(&mut self) -> Option<&mut ActiveEpoch> {
        self.active.as_mut()
    }

    pub(crate) fn current_epoch(&self) -> EpochNo {
        self.current_epoch
    }

    pub(crate) fn phase(&self) -> EpochPhase {
        match &self.active {
            Some(active) if active.is_done() => EpochPhase::Ending,
            Some(_) => EpochPhase::Active,
            None => EpochPhase::Pending,
        }
    }

    // ── Suspicion ───────────────────────────────────────────────────────────

    /// Record a suspicion of `epoch` from `source` and act on the quorums it
    /// may complete.
    pub(crate) fn apply_suspect(
        &mut self,
        source: NodeId,
        epoch: EpochNo,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        if epoch < self.current_epoch {
            trace!(epoch, %source, "stale suspect");
            return Actions::default();
        }
        let my_id = self.params.id;
        let weak = self.network.weak_quorum();
        let strong = self.network.strong_quorum();

        let (join, change) = {
            let target = self.targets.entry(epoch).or_default();
            if !target.suspicions.insert(source) {
                return Actions::default();
            }
            let join = target.suspicions.len() >= weak && !target.suspicions.contains(&my_id);
            if join {
                target.suspicions.insert(my_id);
            }
            let change = target.suspicions.len() >= strong && !target.change_broadcast;
            if change {
                target.change_broadcast = true;
            }
            (join, change)
        };

        let mut actions = Actions::default();
        if join {
            info!(epoch, "joining epoch suspicion");
            actions.send(Msg::Suspect { epoch });
            actions.append(persisted.add_suspect(epoch));
            if let Some(active) = self.active.as_mut() {
                if active.epoch_no() == epoch {
                    active.mark_suspicious();
                }
            }
        }
        if change {
            let epoch_change = persisted.epoch_change(epoch + 1);
            info!(
                epoch,
                new_epoch = epoch + 1,
                "epoch given up, broadcasting epoch change"
            );
            actions.append(persisted.add_epoch_change(epoch_change.clone()));
            actions.send(Msg::EpochChange(epoch_change.clone()));

            if self.active.as_ref().is_some_and(|a| a.epoch_no() <= epoch) {
                self.active = None;
                clients.clear_allocations();
            }
            self.current_epoch = epoch + 1;
            self.pending_ticks = 0;
            actions.append(self.apply_epoch_change(my_id, epoch_change, clients, persisted));
        }
        actions
    }

    // ── Epoch change ────────────────────────────────────────────────────────

    pub(crate) fn apply_epoch_change(
        &mut self,
        source: NodeId,
        change: EpochChange,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let epoch = change.new_epoch;
        if self.is_settled(epoch) {
            trace!(epoch, %source, "stale epoch change");
            return Actions::default();
        }
        {
            let target = self.targets.entry(epoch).or_default();
            if target.changes.contains_key(&source) {
                return Actions::default();
            }
            target.changes.insert(source, change.clone());
        }

        let mut actions = Actions::default();
        if source != self.params.id {
            actions.send(Msg::EpochChangeAck {
                originator: source,
                epoch_change: change,
            });
        }
        actions.append(self.try_propose_new_epoch(epoch, clients, persisted));
        actions
    }

    /// An ack corroborates a change we may not have received directly: a
    /// weak quorum of acks adopts it on the originator's behalf.
    pub(crate) fn apply_epoch_change_ack(
        &mut self,
        source: NodeId,
        originator: NodeId,
        change: EpochChange,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let epoch = change.new_epoch;
        if self.is_settled(epoch) {
            return Actions::default();
        }
        let adopt = {
            let target = self.targets.entry(epoch).or_default();
            if !target.acks.entry(originator).or_default().insert(source) {
                return Actions::default();
            }
            target.acks[&originator].len() >= self.network.weak_quorum()
                && !target.changes.contains_key(&originator)
        };
        if !adopt {
            return Actions::default();
        }
        debug!(epoch, %originator, "adopting epoch change via acks");
        self.targets
            .entry(epoch)
            .or_default()
            .changes
            .insert(originator, change);
        self.try_propose_new_epoch(epoch, clients, persisted)
    }

    /// If we are the primary of `epoch` and hold a strong quorum of
    /// changes, assemble and broadcast the new-epoch proposal.
    fn try_propose_new_epoch(
        &mut self,
        epoch: EpochNo,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let my_id = self.params.id;
        if self.network.primary(epoch) != my_id {
            return Actions::default();
        }
        let changes: Vec<(NodeId, EpochChange)> = {
            let target = self.targets.entry(epoch).or_default();
            if target.changes.len() < self.network.strong_quorum() || target.new_epoch_broadcast {
                return Actions::default();
            }
            target.new_epoch_broadcast = true;
            target
                .changes
                .iter()
                .map(|(id, change)| (*id, change.clone()))
                .collect()
        };

        // Base checkpoint: the highest any contributor can vouch for.
        let (checkpoint_seq_no, checkpoint_value) = changes
            .iter()
            .map(|(_, change)| (change.checkpoint_seq_no, change.checkpoint_value.clone()))
            .max_by_key(|(seq_no, _)| *seq_no)
            .expect("strong quorum of changes");

        // Re-drive the newest preprepare per slot above the base.
        let mut preprepares: BTreeMap<SeqNo, EntryRef> = BTreeMap::new();
        for (_, change) in &changes {
            for entry in &change.q_set {
                if entry.seq_no <= checkpoint_seq_no {
                    continue;
                }
                let newer = preprepares
                    .get(&entry.seq_no)
                    .map_or(true, |known| entry.epoch > known.epoch);
                if newer {
                    preprepares.insert(entry.seq_no, entry.clone());
                }
            }
        }

        // The contributors become the next leader set: deterministic from
        // the proposal, at least 2f+1, and excludes exactly the replicas
        // that produced no epoch change.
        let leaders: Vec<NodeId> = changes.iter().map(|(id, _)| *id).collect();
        let new_epoch = NewEpoch {
            config: EpochConfig {
                number: epoch,
                leaders,
                planned_expiration: checkpoint_seq_no + self.network.epoch_length,
            },
            checkpoint_seq_no,
            checkpoint_value,
            preprepares: preprepares.into_values().collect(),
        };
        info!(
            epoch,
            base = checkpoint_seq_no,
            preprepares = new_epoch.preprepares.len(),
            "proposing new epoch"
        );

        let mut actions = Actions::default();
        actions.send(Msg::NewEpoch(new_epoch.clone()));
        actions.append(self.apply_new_epoch(my_id, new_epoch, clients, persisted));
        actions
    }

    pub(crate) fn apply_new_epoch(
        &mut self,
        source: NodeId,
        new_epoch: NewEpoch,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let epoch = new_epoch.config.number;
        if self.is_settled(epoch) {
            return Actions::default();
        }
        if !self.validate_new_epoch(source, &new_epoch) {
            return Actions::default();
        }
        let echo = {
            let target = self.targets.entry(epoch).or_default();
            if target.new_epoch.is_none() {
                target.new_epoch = Some(new_epoch.clone());
            }
            !target.echo_broadcast
        };
        if !echo {
            return Actions::default();
        }
        self.targets.get_mut(&epoch).unwrap().echo_broadcast = true;

        let mut actions = Actions::default();
        actions.send(Msg::NewEpochEcho(new_epoch.clone()));
        actions.append(self.apply_new_epoch_echo(self.params.id, new_epoch, clients, persisted));
        actions
    }

    pub(crate) fn apply_new_epoch_echo(
        &mut self,
        source: NodeId,
        new_epoch: NewEpoch,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let epoch = new_epoch.config.number;
        if self.is_settled(epoch) {
            return Actions::default();
        }
        let ready = {
            let target = self.targets.entry(epoch).or_default();
            if target.new_epoch.is_none() {
                target.new_epoch = Some(new_epoch.clone());
            } else if target.new_epoch.as_ref() != Some(&new_epoch) {
                warn!(epoch, %source, "echo for a conflicting new-epoch proposal");
                return Actions::default();
            }
            if !target.echoes.insert(source) {
                return Actions::default();
            }
            target.echoes.len() >= self.network.strong_quorum() && !target.ready_broadcast
        };
        if !ready {
            return Actions::default();
        }
        self.targets.get_mut(&epoch).unwrap().ready_broadcast = true;

        let mut actions = Actions::default();
        actions.send(Msg::NewEpochReady(new_epoch.clone()));
        actions.append(self.apply_new_epoch_ready(self.params.id, new_epoch, clients, persisted));
        actions
    }

    pub(crate) fn apply_new_epoch_ready(
        &mut self,
        source: NodeId,
        new_epoch: NewEpoch,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let epoch = new_epoch.config.number;
        if self.is_settled(epoch) {
            return Actions::default();
        }
        let (amplify, activate) = {
            let target = self.targets.entry(epoch).or_default();
            if target.new_epoch.is_none() {
                target.new_epoch = Some(new_epoch.clone());
            } else if target.new_epoch.as_ref() != Some(&new_epoch) {
                warn!(epoch, %source, "ready for a conflicting new-epoch proposal");
                return Actions::default();
            }
            if !target.readies.insert(source) {
                return Actions::default();
            }
            let amplify =
                target.readies.len() >= self.network.weak_quorum() && !target.ready_broadcast;
            if amplify {
                target.ready_broadcast = true;
            }
            (amplify, target.readies.len() >= self.network.strong_quorum())
        };

        let mut actions = Actions::default();
        if amplify {
            actions.send(Msg::NewEpochReady(new_epoch.clone()));
            actions.append(self.apply_new_epoch_ready(
                self.params.id,
                new_epoch.clone(),
                clients,
                persisted,
            ));
            // Our own ready may have completed the quorum.
            if self.active.as_ref().is_some_and(|a| a.epoch_no() >= epoch) {
                return actions;
            }
        }
        if activate {
            actions.append(self.activate(new_epoch, clients, persisted));
        }
        actions
    }

    fn validate_new_epoch(&self, source: NodeId, new_epoch: &NewEpoch) -> bool {
        let config = &new_epoch.config;
        if self.network.primary(config.number) != source {
            warn!(epoch = config.number, %source, "new epoch from a non-primary");
            return false;
        }
        if config.leaders.len() < self.network.strong_quorum()
            || !config
                .leaders
                .iter()
                .all(|leader| self.network.nodes.contains(leader))
        {
            warn!(epoch = config.number, "new epoch with an invalid leader set");
            return false;
        }
        if config.planned_expiration <= new_epoch.checkpoint_seq_no {
            warn!(epoch = config.number, "new epoch expires before it starts");
            return false;
        }
        true
    }

    /// Persist `NewEpochStart` and bring up the new window, provided the
    /// base checkpoint is locally available.
    fn activate(
        &mut self,
        new_epoch: NewEpoch,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.epoch_no() >= new_epoch.config.number)
        {
            return Actions::default();
        }
        if !persisted.has_checkpoint(new_epoch.checkpoint_seq_no, &new_epoch.checkpoint_value) {
            warn!(
                epoch = new_epoch.config.number,
                base = new_epoch.checkpoint_seq_no,
                "missing the base checkpoint, awaiting state transfer"
            );
            return Actions::default();
        }

        let mut actions = persisted.add_new_epoch_start(new_epoch.config.clone());
        clients.clear_allocations();
        let (active, recovery) = ActiveEpoch::new(persisted, clients, &self.params);

        // Ask the primary for batches the proposal re-drives but we lack.
        let primary = self.network.primary(new_epoch.config.number);
        for entry in &new_epoch.preprepares {
            if persisted.find_q_entry(entry.seq_no, &entry.digest).is_none() {
                actions.send_to(
                    primary,
                    Msg::FetchBatch {
                        seq_no: entry.seq_no,
                        digest: entry.digest.clone(),
                    },
                );
            }
        }

        info!(epoch = new_epoch.config.number, "epoch active");
        self.current_epoch = new_epoch.config.number;
        self.pending_ticks = 0;
        self.active = Some(active);
        self.targets = self.targets.split_off(&self.current_epoch);
        actions.append(recovery);
        actions.append(self.active.as_mut().unwrap().drain_proposer(clients));
        actions
    }

    /// Re-attempt a blocked activation, e.g. after state transfer installed
    /// the base checkpoint.
    pub(crate) fn retry_activation(
        &mut self,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        if self.active.is_some() {
            return Actions::default();
        }
        let proposal = self.targets.get(&self.current_epoch).and_then(|target| {
            (target.readies.len() >= self.network.strong_quorum())
                .then(|| target.new_epoch.clone())
                .flatten()
        });
        match proposal {
            Some(new_epoch) => self.activate(new_epoch, clients, persisted),
            None => Actions::default(),
        }
    }

    /// An epoch at or below an already-settled number needs no tracking.
    fn is_settled(&self, epoch: EpochNo) -> bool {
        epoch < self.current_epoch
            || (epoch == self.current_epoch && self.active.is_some())
    }

    // ── Ticks and rollover ──────────────────────────────────────────────────

    pub(crate) fn tick(
        &mut self,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        if self.active.is_some() {
            let (was_suspicious, epoch) = {
                let active = self.active.as_ref().unwrap();
                (active.suspicious(), active.epoch_no())
            };
            let mut actions = self.active.as_mut().unwrap().tick(clients, persisted);
            let now_suspicious = self
                .active
                .as_ref()
                .is_some_and(|active| active.suspicious());
            if now_suspicious && !was_suspicious {
                actions.append(self.apply_suspect(self.params.id, epoch, clients, persisted));
            }
            actions.append(self.maybe_rollover(clients, persisted));
            return actions;
        }

        self.pending_ticks += 1;
        if self.pending_ticks <= self.params.new_epoch_timeout_ticks {
            return Actions::default();
        }
        self.pending_ticks = 0;
        let epoch = self.current_epoch;
        warn!(epoch, "new epoch activation timed out, suspecting it");
        let mut actions = Actions::default();
        actions.send(Msg::Suspect { epoch });
        actions.append(persisted.add_suspect(epoch));
        actions.append(self.apply_suspect(self.params.id, epoch, clients, persisted));
        actions
    }

    /// Roll an epoch that delivered its whole planned window into its
    /// successor, keeping the leader set. Purely local and deterministic;
    /// the planned case needs no view change.
    pub(crate) fn maybe_rollover(
        &mut self,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let rollover = self.active.as_ref().is_some_and(|active| active.is_done());
        if !rollover {
            return Actions::default();
        }
        let old = self.active.as_ref().unwrap().config().clone();
        let next = EpochConfig {
            number: old.number + 1,
            leaders: old.leaders,
            planned_expiration: old.planned_expiration + self.network.epoch_length,
        };
        info!(
            epoch = old.number,
            next = next.number,
            "epoch expired gracefully, rolling over"
        );
        let mut actions = persisted.add_new_epoch_start(next.clone());
        clients.clear_allocations();
        let (active, recovery) = ActiveEpoch::new(persisted, clients, &self.params);
        self.current_epoch = next.number;
        self.pending_ticks = 0;
        self.active = Some(active);
        self.targets = self.targets.split_off(&self.current_epoch);
        actions.append(recovery);
        actions.append(self.active.as_mut().unwrap().drain_proposer(clients));
        actions
    }
}
