//! Action types for the deterministic state machine.
//!
//! Actions are the caller's responsibility to fulfill. The caller receives a
//! batch of [`Actions`] from the ready stream, executes them, and returns the
//! completions through [`ActionResults`].
//!
//! # Fulfillment order
//!
//! Within one batch the caller must append WAL records in the order
//! `persisted`, then `q_entries`, then `p_entries`, and complete all appends
//! before sending anything from `broadcast`/`unicast`. This realizes the
//! engine's ordering guarantees: a `QEntry` is durable before the matching
//! `Prepare` is on the wire, and a `PEntry` before the matching `Commit`.
//! Checkpoint results must be returned before later commits can be delivered.

use multibft_types::{
    Digest, EpochConfig, EpochNo, Msg, NodeId, PEntry, Persistent, QEntry, RequestData, SeqNo,
};

/// A message to send to a single replica.
#[derive(Debug, Clone)]
pub struct Unicast {
    pub target: NodeId,
    pub msg: Msg,
}

/// A client request to hash (and optionally validate).
///
/// The source is included so callers can apply stricter validation to
/// requests that originated at other replicas.
#[derive(Debug, Clone)]
pub struct Request {
    pub source: NodeId,
    pub request: RequestData,
}

/// A batch of requests allocated to a sequence, to be hashed into the batch
/// digest.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source: NodeId,
    pub seq_no: SeqNo,
    pub epoch: EpochNo,
    pub requests: Vec<RequestData>,
}

/// A batch that achieved final order and is ready to apply.
///
/// If `checkpoint` is set the caller must return a [`CheckpointResult`] for
/// this sequence number; no later commit is delivered until it does.
#[derive(Debug, Clone)]
pub struct Commit {
    pub q_entry: QEntry,
    pub checkpoint: bool,
    pub epoch_config: EpochConfig,
}

/// Actions the state machine wants the caller to perform.
#[derive(Debug, Clone, Default)]
pub struct Actions {
    /// Messages to send to every replica (including the local one).
    pub broadcast: Vec<Msg>,
    /// Messages to send to specific replicas.
    pub unicast: Vec<Unicast>,
    /// Client requests to hash; each yields a [`PreprocessResult`].
    pub preprocess: Vec<Request>,
    /// Allocated batches to hash; each yields a [`ProcessResult`].
    pub process: Vec<Batch>,
    /// Checkpoint and epoch-change records to append to the WAL.
    pub persisted: Vec<Persistent>,
    /// Preprepare records to append to the WAL.
    pub q_entries: Vec<QEntry>,
    /// Prepare records to append to the WAL.
    pub p_entries: Vec<PEntry>,
    /// Batches in final order, ready to apply to the application.
    pub commits: Vec<Commit>,
}

impl Actions {
    /// Append every field of `other` onto the corresponding field of `self`.
    pub fn append(&mut self, other: Actions) {
        self.broadcast.extend(other.broadcast);
        self.unicast.extend(other.unicast);
        self.preprocess.extend(other.preprocess);
        self.process.extend(other.process);
        self.persisted.extend(other.persisted);
        self.q_entries.extend(other.q_entries);
        self.p_entries.extend(other.p_entries);
        self.commits.extend(other.commits);
    }

    /// Drop all pending actions.
    pub fn clear(&mut self) {
        self.broadcast.clear();
        self.unicast.clear();
        self.preprocess.clear();
        self.process.clear();
        self.persisted.clear();
        self.q_entries.clear();
        self.p_entries.clear();
        self.commits.clear();
    }

    /// Whether every field is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of pending actions across all fields.
    pub fn len(&self) -> usize {
        self.broadcast.len()
            + self.unicast.len()
            + self.preprocess.len()
            + self.process.len()
            + self.persisted.len()
            + self.q_entries.len()
            + self.p_entries.len()
            + self.commits.len()
    }

    /// Queue a broadcast.
    pub fn send(&mut self, msg: Msg) {
        self.broadcast.push(msg);
    }

    /// Queue a unicast.
    pub fn send_to(&mut self, target: NodeId, msg: Msg) {
        self.unicast.push(Unicast { target, msg });
    }
}

/// Result of hashing (and validating) one client request.
#[derive(Debug, Clone)]
pub struct PreprocessResult {
    pub request: RequestData,
    pub digest: Digest,
    /// Set if the request fails application validation. Validation must be
    /// deterministic across replicas.
    pub invalid: bool,
}

/// Result of hashing one allocated batch.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub batch: Batch,
    pub digest: Digest,
}

/// A verifiable application checkpoint, returned for every commit that was
/// flagged as a checkpoint boundary.
#[derive(Debug, Clone)]
pub struct CheckpointResult {
    pub seq_no: SeqNo,
    /// Concise attestation of the application state with all entries up to
    /// `seq_no` applied, typically a hash.
    pub value: Vec<u8>,
}

/// Completions the caller feeds back after executing actions.
#[derive(Debug, Clone, Default)]
pub struct ActionResults {
    pub preprocessed: Vec<PreprocessResult>,
    pub processed: Vec<ProcessResult>,
    pub checkpoints: Vec<CheckpointResult>,
}

impl ActionResults {
    pub fn is_empty(&self) -> bool {
        self.preprocessed.is_empty() && self.processed.is_empty() && self.checkpoints.is_empty()
    }
}
