//! Serializable state-machine status snapshot.

use crate::sequence::SequenceState;
use multibft_types::{ClientId, EpochNo, ReqNo, SeqNo};
use serde::Serialize;

/// Where the replica stands in the epoch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EpochPhase {
    /// Awaiting activation of the target epoch.
    Pending,
    /// Processing the active epoch.
    Active,
    /// The active epoch reached its planned expiration window.
    Ending,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub id: u64,
    /// The bucket's leader for the current epoch.
    pub owner: u64,
    /// Whether the local replica leads this bucket.
    pub leader: bool,
    /// States of this bucket's slots, low to high.
    pub sequences: Vec<SequenceState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub client_id: ClientId,
    pub low_req_no: ReqNo,
    pub tracked_requests: usize,
}

/// Point-in-time view of the state machine, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub id: u64,
    pub epoch: EpochNo,
    pub phase: EpochPhase,
    pub low_watermark: SeqNo,
    pub high_watermark: SeqNo,
    pub last_committed: SeqNo,
    pub stable_checkpoint: SeqNo,
    pub buckets: Vec<BucketStatus>,
    pub clients: Vec<ClientStatus>,
    /// Action batches handed to the caller so far.
    pub batches_delivered: u64,
}
