//! Write-ahead-log record taxonomy.

use crate::{Digest, EpochChange, EpochConfig, EpochNo, NetworkState, RequestData, SeqNo};

/// Record of a preprepared batch.
///
/// Carries the full request payloads so that a replayed log is
/// self-contained: commit delivery and prepare re-broadcast after a restart
/// need no side store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QEntry {
    pub seq_no: SeqNo,
    pub epoch: EpochNo,
    pub digest: Digest,
    pub requests: Vec<RequestData>,
}

/// Record of a prepared batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PEntry {
    pub seq_no: SeqNo,
    pub epoch: EpochNo,
    pub digest: Digest,
}

/// Record of a local checkpoint: the application attestation plus everything
/// needed to restart from this point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEntry {
    pub seq_no: SeqNo,
    pub value: Vec<u8>,
    pub network_state: NetworkState,
    pub epoch_config: EpochConfig,
}

/// All records the engine asks the caller to append to the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistent {
    QEntry(QEntry),
    PEntry(PEntry),
    CEntry(CEntry),
    EpochChange(EpochChange),
    NewEpochStart(EpochConfig),
    Suspect { epoch: EpochNo },
}

impl Persistent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Persistent::QEntry(_) => "QEntry",
            Persistent::PEntry(_) => "PEntry",
            Persistent::CEntry(_) => "CEntry",
            Persistent::EpochChange(_) => "EpochChange",
            Persistent::NewEpochStart(_) => "NewEpochStart",
            Persistent::Suspect { .. } => "Suspect",
        }
    }
}
