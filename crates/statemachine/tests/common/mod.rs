//! In-process cluster harness for protocol scenario tests.
//!
//! Drives N root state machines synchronously: actions are executed
//! immediately (hashing with sha2, persistence into an in-memory log),
//! messages are routed FIFO through a shared queue, and every event and
//! action dump is recorded for replay and ordering assertions.

use multibft_core::{
    ActionResults, Actions, CheckpointResult, Event, InitialParameters, PreprocessResult,
    ProcessResult,
};
use multibft_statemachine::StateMachine;
use multibft_types::{
    CEntry, Digest, EpochConfig, Msg, NetworkConfig, NetworkState, NodeId, Persistent,
    RequestData, SeqNo,
};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub fn sha(data: &[u8]) -> Digest {
    Digest(Sha256::digest(data).to_vec())
}

/// The harness hashes a batch as the digest of its concatenated payloads.
pub fn batch_digest(requests: &[RequestData]) -> Digest {
    let mut hasher = Sha256::new();
    for request in requests {
        hasher.update(&request.data);
    }
    Digest(hasher.finalize().to_vec())
}

/// One fulfilled action, in fulfillment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fulfilled {
    Persist(&'static str, SeqNo),
    Send(&'static str, SeqNo),
}

pub struct TestNode {
    pub id: NodeId,
    pub sm: StateMachine,
    pub wal: Vec<Persistent>,
    pub commits: Vec<multibft_core::Commit>,
    pub pending_checkpoints: Vec<SeqNo>,
    pub events: Vec<Event>,
    pub action_dumps: Vec<String>,
    pub log: Vec<Fulfilled>,
}

pub struct ClusterConfig {
    pub nodes: u64,
    pub batch_size: u32,
    pub checkpoint_interval: SeqNo,
    pub heartbeat_ticks: u32,
    pub suspect_ticks: u32,
    pub auto_checkpoint: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            batch_size: 1,
            checkpoint_interval: 5,
            heartbeat_ticks: 1,
            suspect_ticks: 10,
            auto_checkpoint: true,
        }
    }
}

pub struct Cluster {
    pub network_state: NetworkState,
    pub auto_checkpoint: bool,
    pub nodes: Vec<TestNode>,
    pub dead: BTreeSet<NodeId>,
    queue: VecDeque<(NodeId, NodeId, Msg)>,
    broadcast_counts: BTreeMap<&'static str, usize>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        let node_ids: Vec<NodeId> = (0..config.nodes).map(NodeId).collect();
        let network = NetworkConfig {
            nodes: node_ids.clone(),
            number_of_buckets: config.nodes,
            checkpoint_interval: config.checkpoint_interval,
            epoch_length: config.checkpoint_interval * 100,
        };
        let network_state = NetworkState {
            config: network,
            clients: node_ids.iter().map(|n| n.0).collect(),
        };

        let mut cluster = Cluster {
            network_state: network_state.clone(),
            auto_checkpoint: config.auto_checkpoint,
            nodes: node_ids
                .iter()
                .map(|id| TestNode {
                    id: *id,
                    sm: StateMachine::new(),
                    wal: Vec::new(),
                    commits: Vec::new(),
                    pending_checkpoints: Vec::new(),
                    events: Vec::new(),
                    action_dumps: Vec::new(),
                    log: Vec::new(),
                })
                .collect(),
            dead: BTreeSet::new(),
            queue: VecDeque::new(),
            broadcast_counts: BTreeMap::new(),
        };

        for index in 0..cluster.nodes.len() {
            let id = cluster.nodes[index].id;
            cluster.apply(
                index,
                Event::Initialize(InitialParameters {
                    id,
                    batch_size: config.batch_size,
                    heartbeat_ticks: config.heartbeat_ticks,
                    suspect_ticks: config.suspect_ticks,
                    new_epoch_timeout_ticks: 8,
                    buffer_size: 500,
                }),
            );
            for (i, entry) in genesis_entries(&network_state).into_iter().enumerate() {
                cluster.apply(
                    index,
                    Event::LoadEntry {
                        index: i as u64,
                        entry,
                    },
                );
            }
            cluster.apply(index, Event::CompleteInitialization);
        }
        cluster
    }

    /// Apply an event to one node, recording it, then immediately fulfill
    /// the resulting actions.
    pub fn apply(&mut self, node: usize, event: Event) {
        self.nodes[node].events.push(event.clone());
        let actions = self.nodes[node].sm.apply(event);
        self.nodes[node].action_dumps.push(format!("{actions:?}"));
        self.execute(node, actions);
    }

    fn execute(&mut self, node: usize, actions: Actions) {
        let id = self.nodes[node].id;
        let mut results = ActionResults::default();

        // Persistence first, in the documented order, then sends.
        for entry in &actions.persisted {
            self.nodes[node]
                .log
                .push(Fulfilled::Persist(entry.type_name(), persist_seq(entry)));
            self.nodes[node].wal.push(entry.clone());
        }
        for q_entry in &actions.q_entries {
            self.nodes[node]
                .log
                .push(Fulfilled::Persist("QEntry", q_entry.seq_no));
            self.nodes[node].wal.push(Persistent::QEntry(q_entry.clone()));
        }
        for p_entry in &actions.p_entries {
            self.nodes[node]
                .log
                .push(Fulfilled::Persist("PEntry", p_entry.seq_no));
            self.nodes[node].wal.push(Persistent::PEntry(p_entry.clone()));
        }

        for msg in &actions.broadcast {
            *self.broadcast_counts.entry(msg.type_name()).or_default() += 1;
            self.nodes[node]
                .log
                .push(Fulfilled::Send(msg.type_name(), msg_seq(msg)));
            if !self.dead.contains(&id) {
                for target in self.node_ids() {
                    self.queue.push_back((id, target, msg.clone()));
                }
            }
        }
        for unicast in &actions.unicast {
            self.nodes[node]
                .log
                .push(Fulfilled::Send(unicast.msg.type_name(), msg_seq(&unicast.msg)));
            if !self.dead.contains(&id) {
                self.queue.push_back((id, unicast.target, unicast.msg.clone()));
            }
        }

        for request in &actions.preprocess {
            results.preprocessed.push(PreprocessResult {
                request: request.request.clone(),
                digest: sha(&request.request.data),
                invalid: false,
            });
        }
        for batch in &actions.process {
            results.processed.push(ProcessResult {
                batch: batch.clone(),
                digest: batch_digest(&batch.requests),
            });
        }

        for commit in &actions.commits {
            self.nodes[node].commits.push(commit.clone());
            if commit.checkpoint {
                let seq_no = commit.q_entry.seq_no;
                if self.auto_checkpoint {
                    results.checkpoints.push(CheckpointResult {
                        seq_no,
                        value: checkpoint_value(&self.nodes[node], seq_no),
                    });
                } else {
                    self.nodes[node].pending_checkpoints.push(seq_no);
                }
            }
        }

        if !results.is_empty() {
            self.apply(node, Event::AddResults(results));
        }
    }

    /// Supply the checkpoint result a node is holding commits for.
    pub fn release_checkpoint(&mut self, node: usize, seq_no: SeqNo) {
        self.nodes[node].pending_checkpoints.retain(|s| *s != seq_no);
        let value = checkpoint_value(&self.nodes[node], seq_no);
        self.apply(
            node,
            Event::AddResults(ActionResults {
                checkpoints: vec![CheckpointResult { seq_no, value }],
                ..ActionResults::default()
            }),
        );
    }

    /// Deliver queued messages until the network is quiet.
    pub fn deliver_all(&mut self) {
        while let Some((from, to, msg)) = self.queue.pop_front() {
            if self.dead.contains(&from) || self.dead.contains(&to) {
                continue;
            }
            let index = self
                .nodes
                .iter()
                .position(|n| n.id == to)
                .expect("message to unknown node");
            self.apply(index, Event::Step { source: from, msg });
        }
    }

    pub fn propose(&mut self, node: usize, data: Vec<u8>) {
        self.apply(node, Event::Propose { data });
    }

    pub fn tick_all(&mut self) {
        for index in 0..self.nodes.len() {
            if !self.dead.contains(&self.nodes[index].id) {
                self.apply(index, Event::Tick);
            }
        }
    }

    pub fn kill(&mut self, node: usize) {
        let id = self.nodes[node].id;
        self.dead.insert(id);
    }

    pub fn broadcasts(&self, kind: &str) -> usize {
        self.broadcast_counts.get(kind).copied().unwrap_or(0)
    }

    /// Delivered commits of one node, as `(seq_no, digest)` pairs.
    pub fn committed(&self, node: usize) -> Vec<(SeqNo, Digest)> {
        self.nodes[node]
            .commits
            .iter()
            .map(|c| (c.q_entry.seq_no, c.q_entry.digest.clone()))
            .collect()
    }

    /// Assert every pair of live replicas delivered identical commit
    /// streams, in the same order.
    pub fn assert_agreement(&self) {
        let live: Vec<usize> = (0..self.nodes.len())
            .filter(|i| !self.dead.contains(&self.nodes[*i].id))
            .collect();
        let reference = self.committed(live[0]);
        for index in &live[1..] {
            assert_eq!(
                reference,
                self.committed(*index),
                "nodes {} and {} disagree",
                live[0],
                index
            );
        }
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }
}

/// Application attestation at a checkpoint: the hash of every committed
/// batch digest up to the boundary. Identical across correct replicas.
pub fn checkpoint_value(node: &TestNode, seq_no: SeqNo) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for commit in &node.commits {
        if commit.q_entry.seq_no <= seq_no {
            hasher.update(commit.q_entry.digest.as_bytes());
        }
    }
    hasher.finalize().to_vec()
}

pub fn genesis_entries(network_state: &NetworkState) -> Vec<Persistent> {
    let epoch_config = EpochConfig {
        number: 0,
        leaders: network_state.config.nodes.clone(),
        planned_expiration: network_state.config.epoch_length,
    };
    vec![
        Persistent::CEntry(CEntry {
            seq_no: 0,
            value: Vec::new(),
            network_state: network_state.clone(),
            epoch_config: epoch_config.clone(),
        }),
        Persistent::NewEpochStart(epoch_config),
    ]
}

fn msg_seq(msg: &Msg) -> SeqNo {
    match msg {
        Msg::Preprepare { seq_no, .. }
        | Msg::Prepare { seq_no, .. }
        | Msg::Commit { seq_no, .. }
        | Msg::Checkpoint { seq_no, .. }
        | Msg::FetchBatch { seq_no, .. }
        | Msg::ForwardBatch { seq_no, .. } => *seq_no,
        _ => 0,
    }
}

fn persist_seq(entry: &Persistent) -> SeqNo {
    match entry {
        Persistent::QEntry(q) => q.seq_no,
        Persistent::PEntry(p) => p.seq_no,
        Persistent::CEntry(c) => c.seq_no,
        _ => 0,
    }
}
