//! The root state machine: initialization, dispatch, status.
//!
//! Apply events in the mandatory order — `Initialize`, every `LoadEntry`,
//! `CompleteInitialization` — then feed `Step`/`Propose`/`Tick`/`AddResults`
//! freely. Every method is synchronous and deterministic; invariant
//! violations panic, which the serializer traps into a terminal error.

use crate::buffer::MsgBuffers;
use crate::checkpoints::CheckpointTracker;
use crate::client::ClientTracker;
use crate::epoch_tracker::EpochTracker;
use crate::persisted::PersistedLog;
use crate::status::StatusSnapshot;
use multibft_core::{ActionResults, Actions, Event, InitialParameters, Request};
use multibft_types::{
    CEntry, EpochNo, Msg, NetworkState, NodeId, RequestAck, RequestData, SeqNo,
};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingInitialize,
    Loading,
    Ready,
}

/// The deterministic replication engine for one replica.
pub struct StateMachine {
    phase: Phase,
    params: Option<InitialParameters>,
    persisted: PersistedLog,
    clients: Option<ClientTracker>,
    epochs: Option<EpochTracker>,
    checkpoints: Option<CheckpointTracker>,
    buffers: MsgBuffers,
    batches_delivered: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("phase", &self.phase)
            .field("id", &self.params.as_ref().map(|p| p.id))
            .field(
                "epoch",
                &self.epochs.as_ref().map(|e| e.current_epoch()),
            )
            .field("last_committed", &self.persisted.last_committed())
            .finish()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingInitialize,
            params: None,
            persisted: PersistedLog::default(),
            clients: None,
            epochs: None,
            checkpoints: None,
            buffers: MsgBuffers::new(1),
            batches_delivered: 0,
        }
    }

    /// Apply one event, returning the actions it produced.
    pub fn apply(&mut self, event: Event) -> Actions {
        trace!(event = event.type_name(), "applying event");
        match event {
            Event::Initialize(params) => {
                if self.phase != Phase::AwaitingInitialize {
                    panic!("Initialize applied twice");
                }
                self.buffers = MsgBuffers::new(params.buffer_size as usize);
                self.params = Some(params);
                self.phase = Phase::Loading;
                Actions::default()
            }
            Event::LoadEntry { index, entry } => {
                if self.phase != Phase::Loading {
                    panic!("LoadEntry outside the initialization sequence");
                }
                self.persisted.load(index, entry);
                Actions::default()
            }
            Event::CompleteInitialization => self.complete_initialization(),
            Event::Step { source, msg } => {
                let before = self.window_key();
                let mut actions = self.step(source, msg);
                actions.append(self.flush_buffers(before));
                actions
            }
            Event::Propose { data } => {
                self.expect_ready();
                self.clients.as_mut().unwrap().allocate_proposal(data)
            }
            Event::Tick => {
                self.expect_ready();
                let before = self.window_key();
                let mut actions = self.epochs.as_mut().unwrap().tick(
                    self.clients.as_mut().unwrap(),
                    &mut self.persisted,
                );
                actions.append(self.flush_buffers(before));
                actions
            }
            Event::AddResults(results) => {
                let before = self.window_key();
                let mut actions = self.apply_results(results);
                actions.append(self.flush_buffers(before));
                actions
            }
            Event::StateTransfer {
                seq_no,
                value,
                network_state,
            } => {
                let before = self.window_key();
                let mut actions = self.apply_state_transfer(seq_no, value, network_state);
                actions.append(self.flush_buffers(before));
                actions
            }
            Event::ActionsReceived => {
                self.batches_delivered += 1;
                Actions::default()
            }
        }
    }

    fn expect_ready(&self) {
        if self.phase != Phase::Ready {
            panic!("event applied before initialization completed");
        }
    }

    fn complete_initialization(&mut self) -> Actions {
        if self.phase != Phase::Loading {
            panic!("CompleteInitialization outside the initialization sequence");
        }
        self.phase = Phase::Ready;
        let params = self.params.clone().unwrap();
        let base = self
            .persisted
            .latest_c_entry()
            .expect("persisted log contains no checkpoint; bootstrap entries are required")
            .clone();
        let network = base.network_state.config.clone();
        if let Err(err) = network.validate() {
            panic!("invalid network configuration in checkpoint: {err}");
        }

        let mut clients =
            ClientTracker::new(network.clone(), &base.network_state.clients, params.id);
        let (epochs, actions) =
            EpochTracker::new(network.clone(), &mut self.persisted, &mut clients, &params);
        self.checkpoints = Some(CheckpointTracker::new(
            network.strong_quorum(),
            base.seq_no,
        ));
        self.clients = Some(clients);
        self.epochs = Some(epochs);

        info!(
            node = params.id.0,
            base = base.seq_no,
            epoch = self.epochs.as_ref().unwrap().current_epoch(),
            "initialization complete"
        );
        actions
    }

    // ── Message dispatch ────────────────────────────────────────────────────

    fn step(&mut self, source: NodeId, msg: Msg) -> Actions {
        self.expect_ready();
        let my_id = self.params.as_ref().unwrap().id;
        let epochs = self.epochs.as_mut().unwrap();
        let clients = self.clients.as_mut().unwrap();
        let checkpoints = self.checkpoints.as_mut().unwrap();
        let buffers = &mut self.buffers;
        let persisted = &mut self.persisted;

        match msg {
            Msg::Preprepare { seq_no, epoch, batch } => {
                match Self::route(epochs, epoch, seq_no) {
                    Route::Apply => {
                        let active = epochs.active_mut().unwrap();
                        let was_suspicious = active.suspicious();
                        let mut actions =
                            active.apply_preprepare_msg(source, seq_no, batch, clients, persisted);
                        let now_suspicious =
                            epochs.active().is_some_and(|a| a.suspicious());
                        if now_suspicious && !was_suspicious {
                            actions.append(epochs.apply_suspect(
                                my_id, epoch, clients, persisted,
                            ));
                        }
                        actions
                    }
                    Route::Buffer => {
                        buffers.store(source, Msg::Preprepare { seq_no, epoch, batch });
                        Actions::default()
                    }
                    Route::Stale => Actions::default(),
                }
            }
            Msg::Prepare { seq_no, epoch, digest } => match Self::route(epochs, epoch, seq_no) {
                Route::Apply => epochs.active_mut().unwrap().apply_prepare_msg(
                    source, seq_no, digest, clients, persisted,
                ),
                Route::Buffer => {
                    buffers.store(source, Msg::Prepare { seq_no, epoch, digest });
                    Actions::default()
                }
                Route::Stale => Actions::default(),
            },
            Msg::Commit { seq_no, epoch, digest } => match Self::route(epochs, epoch, seq_no) {
                Route::Apply => epochs.active_mut().unwrap().apply_commit_msg(
                    source, seq_no, digest, clients, persisted,
                ),
                Route::Buffer => {
                    buffers.store(source, Msg::Commit { seq_no, epoch, digest });
                    Actions::default()
                }
                Route::Stale => Actions::default(),
            },
            Msg::Checkpoint { seq_no, value } => {
                let stable = checkpoints.apply_checkpoint_msg(source, seq_no, value);
                Self::stabilize(stable, epochs, clients, persisted)
            }
            Msg::Suspect { epoch } => epochs.apply_suspect(source, epoch, clients, persisted),
            Msg::EpochChange(change) => {
                epochs.apply_epoch_change(source, change, clients, persisted)
            }
            Msg::EpochChangeAck {
                originator,
                epoch_change,
            } => epochs.apply_epoch_change_ack(source, originator, epoch_change, clients, persisted),
            Msg::NewEpoch(new_epoch) => {
                epochs.apply_new_epoch(source, new_epoch, clients, persisted)
            }
            Msg::NewEpochEcho(new_epoch) => {
                epochs.apply_new_epoch_echo(source, new_epoch, clients, persisted)
            }
            Msg::NewEpochReady(new_epoch) => {
                epochs.apply_new_epoch_ready(source, new_epoch, clients, persisted)
            }
            Msg::RequestAck(ack) => {
                clients.apply_request_ack(source, ack, checkpoints.stable());
                match epochs.active_mut() {
                    Some(active) => active.drain_proposer(clients),
                    None => Actions::default(),
                }
            }
            Msg::ForwardRequest(request) => {
                Self::accept_forwarded(source, request, epochs, clients)
            }
            Msg::FetchRequest {
                client_id,
                req_no,
                digest,
            } => {
                let ack = RequestAck {
                    client_id,
                    req_no,
                    digest,
                };
                let mut actions = Actions::default();
                if !ack.digest.is_null() {
                    if let Some(data) = clients.resolve(&ack) {
                        actions.send_to(source, Msg::ForwardRequest(data));
                    } else {
                        trace!(client_id, req_no, %source, "fetch for an unknown request");
                    }
                }
                actions
            }
            Msg::FetchBatch { seq_no, digest } => {
                let mut actions = Actions::default();
                match persisted.find_q_entry(seq_no, &digest) {
                    Some(q_entry) => actions.send_to(
                        source,
                        Msg::ForwardBatch {
                            seq_no,
                            digest,
                            requests: q_entry.requests.clone(),
                        },
                    ),
                    None => debug!(seq_no, %source, "fetch for an unknown batch"),
                }
                actions
            }
            Msg::ForwardBatch { requests, .. } => {
                let mut actions = Actions::default();
                for request in requests {
                    actions.append(Self::accept_forwarded(source, request, epochs, clients));
                }
                actions
            }
        }
    }

    /// Queue a forwarded payload for preprocessing unless it is already
    /// known and nothing is waiting on it.
    fn accept_forwarded(
        source: NodeId,
        request: RequestData,
        epochs: &EpochTracker,
        clients: &ClientTracker,
    ) -> Actions {
        let known = clients.has_request(request.client_id, request.req_no);
        let needed = epochs
            .active()
            .is_some_and(|a| a.needs_request(request.client_id, request.req_no));
        let mut actions = Actions::default();
        if !known || needed {
            actions.preprocess.push(Request { source, request });
        }
        actions
    }

    /// Drive the consequences of a newly stable checkpoint.
    fn stabilize(
        stable: Option<SeqNo>,
        epochs: &mut EpochTracker,
        clients: &mut ClientTracker,
        persisted: &mut PersistedLog,
    ) -> Actions {
        let Some(stable) = stable else {
            return Actions::default();
        };
        info!(stable, "advancing over stable checkpoint");
        persisted.truncate_below(stable);
        clients.garbage_collect(stable);
        let mut actions = Actions::default();
        if let Some(active) = epochs.active_mut() {
            actions.append(active.move_watermarks(stable, clients, persisted));
        }
        actions.append(epochs.maybe_rollover(clients, persisted));
        actions
    }

    // ── Results ─────────────────────────────────────────────────────────────

    fn apply_results(&mut self, results: ActionResults) -> Actions {
        self.expect_ready();
        let my_id = self.params.as_ref().unwrap().id;
        let epochs = self.epochs.as_mut().unwrap();
        let clients = self.clients.as_mut().unwrap();
        let checkpoints = self.checkpoints.as_mut().unwrap();
        let persisted = &mut self.persisted;

        let mut actions = Actions::default();
        for result in &results.preprocessed {
            actions.append(clients.apply_preprocess_result(result, checkpoints.stable()));
            if let Some(active) = epochs.active_mut() {
                if result.invalid {
                    if active.needs_request(result.request.client_id, result.request.req_no) {
                        // A preprepare depends on a payload the application
                        // rejects: the bucket's leader misbehaved.
                        warn!(
                            client_id = result.request.client_id,
                            req_no = result.request.req_no,
                            "pending preprepare references an invalid request"
                        );
                        let epoch = active.epoch_no();
                        actions.append(active.suspect(persisted));
                        actions.append(epochs.apply_suspect(my_id, epoch, clients, persisted));
                    }
                } else {
                    actions.append(active.resolve_request(
                        &result.request,
                        &result.digest,
                        clients,
                        persisted,
                    ));
                }
            }
        }
        if let Some(active) = epochs.active_mut() {
            actions.append(active.drain_proposer(clients));
        }

        for result in &results.processed {
            let Some(active) = epochs.active_mut() else {
                continue;
            };
            if result.batch.epoch != active.epoch_no() {
                debug!(
                    seq_no = result.batch.seq_no,
                    epoch = result.batch.epoch,
                    "batch hash result for another epoch"
                );
                continue;
            }
            actions.append(active.apply_batch_hash_result(
                result.batch.seq_no,
                result.digest.clone(),
                clients,
                persisted,
            ));
        }

        for result in &results.checkpoints {
            if let Some(active) = epochs.active_mut() {
                actions.append(active.apply_checkpoint_result(
                    result.seq_no,
                    result.value.clone(),
                    clients,
                    persisted,
                ));
            }
            let stable = checkpoints.note_local(my_id, result.seq_no, result.value.clone());
            actions.append(Self::stabilize(stable, epochs, clients, persisted));
        }

        actions.append(epochs.maybe_rollover(clients, persisted));
        actions
    }

    fn apply_state_transfer(
        &mut self,
        seq_no: SeqNo,
        value: Vec<u8>,
        network_state: NetworkState,
    ) -> Actions {
        self.expect_ready();
        let epochs = self.epochs.as_mut().unwrap();
        let clients = self.clients.as_mut().unwrap();
        let checkpoints = self.checkpoints.as_mut().unwrap();
        let persisted = &mut self.persisted;

        let epoch_config = epochs
            .active()
            .map(|a| a.config().clone())
            .or_else(|| persisted.latest_epoch_config().cloned())
            .expect("state transfer before any epoch configuration");
        info!(seq_no, "installing transferred checkpoint");

        let mut actions = persisted.add_c_entry(CEntry {
            seq_no,
            value,
            network_state,
            epoch_config,
        });
        checkpoints.force_stable(seq_no);
        persisted.truncate_below(seq_no);
        clients.garbage_collect(seq_no);
        if let Some(active) = epochs.active_mut() {
            actions.append(active.move_watermarks(seq_no, clients, persisted));
        }
        actions.append(epochs.retry_activation(clients, persisted));
        actions
    }

    // ── Buffering ───────────────────────────────────────────────────────────

    fn window_key(&self) -> (Option<EpochNo>, SeqNo) {
        match self.epochs.as_ref().and_then(|e| e.active()) {
            Some(active) => (Some(active.epoch_no()), active.high_watermark()),
            None => (None, 0),
        }
    }

    /// Re-dispatch buffered messages whenever the window or the epoch
    /// moved; messages that are still premature are re-buffered.
    fn flush_buffers(&mut self, mut key: (Option<EpochNo>, SeqNo)) -> Actions {
        let mut actions = Actions::default();
        loop {
            let now = self.window_key();
            if now == key || self.buffers.is_empty() {
                break;
            }
            key = now;
            for (source, msg) in self.buffers.drain() {
                actions.append(self.step(source, msg));
            }
        }
        actions
    }

    // ── Status ──────────────────────────────────────────────────────────────

    pub fn status(&self) -> StatusSnapshot {
        let (low, high, last_committed, buckets) = match self
            .epochs
            .as_ref()
            .and_then(|e| e.active())
        {
            Some(active) => (
                active.low_watermark(),
                active.high_watermark(),
                active.last_committed(),
                active.status(),
            ),
            None => (0, 0, self.persisted.last_committed(), Vec::new()),
        };
        StatusSnapshot {
            id: self.params.as_ref().map(|p| p.id.0).unwrap_or(0),
            epoch: self.epochs.as_ref().map(|e| e.current_epoch()).unwrap_or(0),
            phase: self
                .epochs
                .as_ref()
                .map(|e| e.phase())
                .unwrap_or(crate::status::EpochPhase::Pending),
            low_watermark: low,
            high_watermark: high,
            last_committed,
            stable_checkpoint: self.checkpoints.as_ref().map(|c| c.stable()).unwrap_or(0),
            buckets,
            clients: self
                .clients
                .as_ref()
                .map(|c| c.status())
                .unwrap_or_default(),
            batches_delivered: self.batches_delivered,
        }
    }
}

/// Where a sequenced protocol message should go.
enum Route {
    Apply,
    Buffer,
    Stale,
}

impl StateMachine {
    fn route(epochs: &EpochTracker, epoch: EpochNo, seq_no: SeqNo) -> Route {
        match epochs.active() {
            Some(active) if active.epoch_no() == epoch => {
                if seq_no > active.high_watermark() {
                    Route::Buffer
                } else if seq_no < active.low_watermark() {
                    Route::Stale
                } else {
                    Route::Apply
                }
            }
            Some(active) if epoch < active.epoch_no() => Route::Stale,
            _ if epoch >= epochs.current_epoch() => Route::Buffer,
            _ => Route::Stale,
        }
    }
}
