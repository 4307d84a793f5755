//! Protocol message taxonomy.
//!
//! These are the messages replicas exchange. No wire format is defined here;
//! the caller owns transport and serialization.

use crate::{ClientId, Digest, EpochConfig, EpochNo, ReqNo, RequestAck, RequestData, SeqNo};
use crate::NodeId;

/// Reference to a persisted batch, used in epoch-change material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRef {
    pub seq_no: SeqNo,
    pub epoch: EpochNo,
    pub digest: Digest,
}

/// A replica's view-change contribution: the state it can vouch for when
/// entering `new_epoch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochChange {
    pub new_epoch: EpochNo,
    /// Last stable checkpoint at the sender.
    pub checkpoint_seq_no: SeqNo,
    pub checkpoint_value: Vec<u8>,
    /// Prepared batches above the checkpoint.
    pub p_set: Vec<EntryRef>,
    /// Preprepared batches above the checkpoint.
    pub q_set: Vec<EntryRef>,
}

/// The new primary's epoch-start proposal, built from `2f+1` epoch changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEpoch {
    pub config: EpochConfig,
    /// The base checkpoint the new epoch starts from.
    pub checkpoint_seq_no: SeqNo,
    pub checkpoint_value: Vec<u8>,
    /// Batches that must be re-driven above the base checkpoint.
    pub preprepares: Vec<EntryRef>,
}

/// All messages a replica can send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// Leader assigns a batch of acked requests to a sequence number.
    Preprepare {
        seq_no: SeqNo,
        epoch: EpochNo,
        batch: Vec<RequestAck>,
    },
    /// A replica vouches for the digest bound to a sequence number.
    Prepare {
        seq_no: SeqNo,
        epoch: EpochNo,
        digest: Digest,
    },
    /// A replica saw a prepare quorum for the digest.
    Commit {
        seq_no: SeqNo,
        epoch: EpochNo,
        digest: Digest,
    },
    /// Application state attestation at a checkpoint boundary.
    Checkpoint { seq_no: SeqNo, value: Vec<u8> },
    /// The sender believes the epoch has stalled.
    Suspect { epoch: EpochNo },
    /// View-change contribution for a new epoch.
    EpochChange(EpochChange),
    /// Acknowledgement that an epoch change from `originator` was received.
    EpochChangeAck {
        originator: NodeId,
        epoch_change: EpochChange,
    },
    /// The new primary's epoch-start proposal.
    NewEpoch(NewEpoch),
    /// Reliable-broadcast echo of a new-epoch proposal.
    NewEpochEcho(NewEpoch),
    /// Reliable-broadcast ready for a new-epoch proposal.
    NewEpochReady(NewEpoch),
    /// Ask a peer for the payloads of a persisted batch.
    FetchBatch { seq_no: SeqNo, digest: Digest },
    /// Reply to [`Msg::FetchBatch`] with the full request payloads.
    ForwardBatch {
        seq_no: SeqNo,
        digest: Digest,
        requests: Vec<RequestData>,
    },
    /// Acknowledge knowledge of a client request digest.
    RequestAck(RequestAck),
    /// Disseminate a client request payload.
    ForwardRequest(RequestData),
    /// Ask a peer for a client request payload it acked.
    FetchRequest {
        client_id: ClientId,
        req_no: ReqNo,
        digest: Digest,
    },
}

impl Msg {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Msg::Preprepare { .. } => "Preprepare",
            Msg::Prepare { .. } => "Prepare",
            Msg::Commit { .. } => "Commit",
            Msg::Checkpoint { .. } => "Checkpoint",
            Msg::Suspect { .. } => "Suspect",
            Msg::EpochChange(_) => "EpochChange",
            Msg::EpochChangeAck { .. } => "EpochChangeAck",
            Msg::NewEpoch(_) => "NewEpoch",
            Msg::NewEpochEcho(_) => "NewEpochEcho",
            Msg::NewEpochReady(_) => "NewEpochReady",
            Msg::FetchBatch { .. } => "FetchBatch",
            Msg::ForwardBatch { .. } => "ForwardBatch",
            Msg::RequestAck(_) => "RequestAck",
            Msg::ForwardRequest(_) => "ForwardRequest",
            Msg::FetchRequest { .. } => "FetchRequest",
        }
    }
}
