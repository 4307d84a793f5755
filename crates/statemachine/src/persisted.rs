//! In-memory mirror of the caller's write-ahead log.
//!
//! Every record the engine asks the caller to persist is also appended here,
//! so the engine can answer epoch-change and fetch queries without reading
//! the caller's storage. The mirror is rebuilt from `LoadEntry` events on
//! startup and truncated when a checkpoint stabilizes.

use multibft_core::Actions;
use multibft_types::{
    CEntry, Digest, EntryRef, EpochChange, EpochConfig, EpochNo, PEntry, Persistent, QEntry, SeqNo,
};
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Default)]
pub(crate) struct PersistedLog {
    /// `(index, record)` pairs, ascending by index.
    entries: Vec<(u64, Persistent)>,
    next_index: u64,
    /// Highest contiguously committed sequence number.
    last_committed: SeqNo,
}

impl PersistedLog {
    /// Mirror one record replayed from the caller's WAL.
    pub(crate) fn load(&mut self, index: u64, entry: Persistent) {
        if let Persistent::CEntry(c) = &entry {
            self.last_committed = self.last_committed.max(c.seq_no);
        }
        self.entries.push((index, entry));
        self.next_index = index + 1;
    }

    /// Append a record, mirroring it and requesting caller persistence.
    fn append(&mut self, entry: Persistent) -> Actions {
        trace!(
            index = self.next_index,
            kind = entry.type_name(),
            "appending persistent entry"
        );
        let mut actions = Actions::default();
        match &entry {
            Persistent::QEntry(q) => actions.q_entries.push(q.clone()),
            Persistent::PEntry(p) => actions.p_entries.push(p.clone()),
            _ => actions.persisted.push(entry.clone()),
        }
        self.entries.push((self.next_index, entry));
        self.next_index += 1;
        actions
    }

    pub(crate) fn add_q_entry(&mut self, q_entry: QEntry) -> Actions {
        self.append(Persistent::QEntry(q_entry))
    }

    pub(crate) fn add_p_entry(&mut self, p_entry: PEntry) -> Actions {
        self.append(Persistent::PEntry(p_entry))
    }

    pub(crate) fn add_c_entry(&mut self, c_entry: CEntry) -> Actions {
        self.append(Persistent::CEntry(c_entry))
    }

    pub(crate) fn add_suspect(&mut self, epoch: EpochNo) -> Actions {
        self.append(Persistent::Suspect { epoch })
    }

    pub(crate) fn add_epoch_change(&mut self, change: EpochChange) -> Actions {
        self.append(Persistent::EpochChange(change))
    }

    pub(crate) fn add_new_epoch_start(&mut self, config: EpochConfig) -> Actions {
        self.append(Persistent::NewEpochStart(config))
    }

    pub(crate) fn last_committed(&self) -> SeqNo {
        self.last_committed
    }

    pub(crate) fn set_last_committed(&mut self, seq_no: SeqNo) {
        self.last_committed = self.last_committed.max(seq_no);
    }

    /// The most recent checkpoint record, if any.
    pub(crate) fn latest_c_entry(&self) -> Option<&CEntry> {
        self.entries.iter().rev().find_map(|(_, e)| match e {
            Persistent::CEntry(c) => Some(c),
            _ => None,
        })
    }

    /// The epoch configuration in force: the latest `NewEpochStart`, falling
    /// back to the latest checkpoint's embedded configuration.
    pub(crate) fn latest_epoch_config(&self) -> Option<&EpochConfig> {
        self.entries.iter().rev().find_map(|(_, e)| match e {
            Persistent::NewEpochStart(config) => Some(config),
            Persistent::CEntry(c) => Some(&c.epoch_config),
            _ => None,
        })
    }

    /// Whether the tail of the log is an unresolved epoch change: an
    /// `EpochChange` record newer than every `NewEpochStart`.
    pub(crate) fn pending_epoch_change(&self) -> Option<&EpochChange> {
        self.entries.iter().rev().find_map(|(_, e)| match e {
            Persistent::EpochChange(change) => Some(Some(change)),
            Persistent::NewEpochStart(_) => Some(None),
            _ => None,
        })?
    }

    /// QEntries above `base`, in index order.
    pub(crate) fn q_entries_above(&self, base: SeqNo) -> impl Iterator<Item = &QEntry> {
        self.entries.iter().filter_map(move |(_, e)| match e {
            Persistent::QEntry(q) if q.seq_no > base => Some(q),
            _ => None,
        })
    }

    /// PEntries above `base`, in index order.
    pub(crate) fn p_entries_above(&self, base: SeqNo) -> impl Iterator<Item = &PEntry> {
        self.entries.iter().filter_map(move |(_, e)| match e {
            Persistent::PEntry(p) if p.seq_no > base => Some(p),
            _ => None,
        })
    }

    /// Find a persisted batch by sequence number and digest.
    pub(crate) fn find_q_entry(&self, seq_no: SeqNo, digest: &Digest) -> Option<&QEntry> {
        self.entries.iter().rev().find_map(|(_, e)| match e {
            Persistent::QEntry(q) if q.seq_no == seq_no && q.digest == *digest => Some(q),
            _ => None,
        })
    }

    /// Whether a checkpoint with this exact attestation is in the log.
    pub(crate) fn has_checkpoint(&self, seq_no: SeqNo, value: &[u8]) -> bool {
        self.entries.iter().any(|(_, e)| match e {
            Persistent::CEntry(c) => c.seq_no == seq_no && c.value == value,
            _ => false,
        })
    }

    /// Drop records made obsolete by a stable checkpoint: everything before
    /// the checkpoint's own record, except batch records still above the
    /// stable sequence number.
    pub(crate) fn truncate_below(&mut self, stable: SeqNo) {
        let Some(cut) = self
            .entries
            .iter()
            .rev()
            .find_map(|(idx, e)| match e {
                Persistent::CEntry(c) if c.seq_no <= stable => Some(*idx),
                _ => None,
            })
        else {
            return;
        };
        self.entries.retain(|(idx, e)| {
            *idx >= cut
                || match e {
                    Persistent::QEntry(q) => q.seq_no > stable,
                    Persistent::PEntry(p) => p.seq_no > stable,
                    _ => false,
                }
        });
    }

    /// Build this replica's view-change contribution for `new_epoch`.
    ///
    /// The p/q sets carry the newest record per sequence number above the
    /// last stable checkpoint.
    pub(crate) fn epoch_change(&self, new_epoch: EpochNo) -> EpochChange {
        let (checkpoint_seq_no, checkpoint_value) = self
            .latest_c_entry()
            .map(|c| (c.seq_no, c.value.clone()))
            .unwrap_or_default();

        let mut q_set: BTreeMap<SeqNo, EntryRef> = BTreeMap::new();
        for q in self.q_entries_above(checkpoint_seq_no) {
            q_set.insert(
                q.seq_no,
                EntryRef {
                    seq_no: q.seq_no,
                    epoch: q.epoch,
                    digest: q.digest.clone(),
                },
            );
        }
        let mut p_set: BTreeMap<SeqNo, EntryRef> = BTreeMap::new();
        for p in self.p_entries_above(checkpoint_seq_no) {
            p_set.insert(
                p.seq_no,
                EntryRef {
                    seq_no: p.seq_no,
                    epoch: p.epoch,
                    digest: p.digest.clone(),
                },
            );
        }

        EpochChange {
            new_epoch,
            checkpoint_seq_no,
            checkpoint_value,
            p_set: p_set.into_values().collect(),
            q_set: q_set.into_values().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multibft_types::{NetworkConfig, NetworkState, NodeId};

    fn c_entry(seq_no: SeqNo) -> CEntry {
        let config = NetworkConfig {
            nodes: vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)],
            number_of_buckets: 4,
            checkpoint_interval: 5,
            epoch_length: 500,
        };
        CEntry {
            seq_no,
            value: vec![seq_no as u8],
            network_state: NetworkState {
                config,
                clients: vec![0, 1, 2, 3],
            },
            epoch_config: EpochConfig {
                number: 0,
                leaders: vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)],
                planned_expiration: 500,
            },
        }
    }

    fn q_entry(seq_no: SeqNo, epoch: EpochNo) -> QEntry {
        QEntry {
            seq_no,
            epoch,
            digest: Digest(vec![seq_no as u8]),
            requests: vec![],
        }
    }

    #[test]
    fn append_routes_records_to_action_fields() {
        let mut log = PersistedLog::default();
        let a = log.add_q_entry(q_entry(1, 0));
        assert_eq!(a.q_entries.len(), 1);
        let a = log.add_suspect(0);
        assert_eq!(a.persisted.len(), 1);
    }

    #[test]
    fn truncation_keeps_batches_above_stable() {
        let mut log = PersistedLog::default();
        log.add_c_entry(c_entry(0));
        log.add_q_entry(q_entry(3, 0));
        log.add_q_entry(q_entry(6, 0));
        log.add_c_entry(c_entry(5));
        log.truncate_below(5);
        assert!(log.find_q_entry(3, &Digest(vec![3])).is_none());
        assert!(log.find_q_entry(6, &Digest(vec![6])).is_some());
        assert_eq!(log.latest_c_entry().unwrap().seq_no, 5);
    }

    #[test]
    fn epoch_change_carries_latest_per_sequence() {
        let mut log = PersistedLog::default();
        log.add_c_entry(c_entry(0));
        log.add_q_entry(q_entry(2, 0));
        log.add_q_entry(q_entry(2, 1));
        let change = log.epoch_change(2);
        assert_eq!(change.checkpoint_seq_no, 0);
        assert_eq!(change.q_set.len(), 1);
        assert_eq!(change.q_set[0].epoch, 1);
    }
}
