//! End-to-end protocol scenarios over the in-process cluster harness.

mod common;

use common::{batch_digest, genesis_entries, sha, Cluster, ClusterConfig, Fulfilled};
use multibft_core::{Event, InitialParameters};
use multibft_statemachine::{SequenceState, StateMachine};
use multibft_types::{
    Msg, NetworkConfig, NetworkState, NodeId, Persistent, QEntry, RequestData,
};

/// Four nodes, one proposal: every bucket leader preprepares once (the idle
/// buckets via heartbeat), every node prepares and commits every sequence,
/// and the proposal lands at sequence 1 with the digest of its payload.
#[test]
fn s1_single_proposal_full_round() {
    let mut cluster = Cluster::new(ClusterConfig::default());

    cluster.propose(0, vec![0x01]);
    cluster.deliver_all();

    // The proposal's bucket committed alone.
    for node in 0..4 {
        assert_eq!(cluster.committed(node), vec![(1, sha(&[0x01]))]);
    }

    // First tick registers the commit progress; the second heartbeats the
    // idle buckets level with the busy one.
    cluster.tick_all();
    cluster.tick_all();
    cluster.deliver_all();

    assert_eq!(cluster.broadcasts("Preprepare"), 4);
    assert_eq!(cluster.broadcasts("Prepare"), 16);
    assert_eq!(cluster.broadcasts("Commit"), 16);

    // Sequences 1-4 all delivered, identically everywhere.
    cluster.assert_agreement();
    let commits = cluster.committed(0);
    assert_eq!(commits.len(), 4);
    assert_eq!(commits[0], (1, sha(&[0x01])));
    assert_eq!(
        commits.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
}

/// Total order and bucket closure over several proposals from one client.
#[test]
fn commits_are_totally_ordered_and_bucket_closed() {
    let mut cluster = Cluster::new(ClusterConfig::default());
    for req in 1..=4u8 {
        cluster.propose(0, vec![req]);
        cluster.deliver_all();
    }
    cluster.assert_agreement();

    let buckets = cluster.network_state.config.number_of_buckets;
    for node in 0..4 {
        let commits = &cluster.nodes[node].commits;
        // Sequence numbers strictly ascend.
        let seqs: Vec<u64> = commits.iter().map(|c| c.q_entry.seq_no).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
        // Every committed request maps to its sequence's bucket.
        for commit in commits.iter() {
            for request in &commit.q_entry.requests {
                assert_eq!(
                    (request.req_no + request.client_id) % buckets,
                    commit.q_entry.seq_no % buckets,
                );
            }
        }
    }
}

/// A stalled leader makes every other replica suspect the epoch, and the
/// resulting epoch change elects the responsive replicas as leaders.
#[test]
fn s2_leader_stall_suspects_and_changes_epoch() {
    let mut cluster = Cluster::new(ClusterConfig {
        suspect_ticks: 4,
        ..ClusterConfig::default()
    });
    cluster.kill(0);

    for _ in 0..3 {
        cluster.tick_all();
        cluster.deliver_all();
    }
    assert_eq!(cluster.broadcasts("Suspect"), 0);

    for _ in 0..9 {
        cluster.tick_all();
        cluster.deliver_all();
    }
    // Every live replica gave up on epoch 0.
    assert!(cluster.broadcasts("Suspect") >= 3);
    for node in 1..4 {
        assert!(cluster.nodes[node]
            .wal
            .iter()
            .any(|entry| matches!(entry, Persistent::Suspect { epoch: 0 })));
    }

    // The change went through: epoch 1 is active without the dead leader.
    for node in 1..4 {
        let status = cluster.nodes[node].sm.status();
        assert_eq!(status.epoch, 1, "node {node} still in epoch 0");
        for bucket in &status.buckets {
            assert_ne!(bucket.owner, 0, "dead node still owns a bucket");
        }
    }

    // The new epoch orders fresh proposals.
    cluster.propose(1, vec![0x42]);
    cluster.deliver_all();
    for _ in 0..6 {
        cluster.tick_all();
        cluster.deliver_all();
    }
    for node in 1..4 {
        assert!(
            cluster.nodes[node].commits.iter().any(|commit| commit
                .q_entry
                .requests
                .iter()
                .any(|request| request.data == vec![0x42])),
            "node {node} never committed the post-change proposal"
        );
    }
    cluster.assert_agreement();
}

/// Five committed proposals reach the checkpoint boundary; the fifth commit
/// carries the checkpoint flag and later commits are held until the caller
/// returns the checkpoint result.
#[test]
fn s3_checkpoint_gates_commit_delivery() {
    let mut cluster = Cluster::new(ClusterConfig {
        auto_checkpoint: false,
        ..ClusterConfig::default()
    });

    // Requests 1-5 from client 0 land in buckets 1,2,3,0,1: exactly
    // sequences 1-5.
    for req in 1..=5u8 {
        cluster.propose(0, vec![req]);
        cluster.deliver_all();
    }
    for node in 0..4 {
        let commits = &cluster.nodes[node].commits;
        assert_eq!(commits.len(), 5);
        assert!(commits[4].checkpoint, "fifth commit must carry the checkpoint flag");
        assert!(!commits[3].checkpoint);
        assert_eq!(cluster.nodes[node].pending_checkpoints, vec![5]);
    }

    // A sixth proposal commits at the protocol level but is not delivered
    // while the checkpoint result is outstanding.
    cluster.propose(0, vec![6]);
    cluster.deliver_all();
    for node in 0..4 {
        assert_eq!(cluster.nodes[node].commits.len(), 5);
    }

    // Returning the checkpoint result releases it, and once the checkpoint
    // messages cross, the watermarks move past the stable boundary.
    for node in 0..4 {
        cluster.release_checkpoint(node, 5);
    }
    cluster.deliver_all();
    for node in 0..4 {
        assert_eq!(cluster.nodes[node].commits.len(), 6);
        assert_eq!(cluster.nodes[node].commits[5].q_entry.seq_no, 6);
        let status = cluster.nodes[node].sm.status();
        assert_eq!(status.stable_checkpoint, 5);
        assert_eq!(status.low_watermark, 6);
    }
    cluster.assert_agreement();
}

/// For every committed sequence, QEntry persistence was requested strictly
/// before any Prepare broadcast and PEntry persistence strictly before any
/// Commit broadcast.
#[test]
fn persistence_is_requested_before_broadcast() {
    let mut cluster = Cluster::new(ClusterConfig::default());
    for req in 1..=5u8 {
        cluster.propose(0, vec![req]);
        cluster.deliver_all();
    }

    for node in 0..4 {
        let log = &cluster.nodes[node].log;
        for (seq_no, _) in cluster.committed(node) {
            let q = log
                .iter()
                .position(|f| *f == Fulfilled::Persist("QEntry", seq_no));
            let prepare = log
                .iter()
                .position(|f| *f == Fulfilled::Send("Prepare", seq_no));
            let p = log
                .iter()
                .position(|f| *f == Fulfilled::Persist("PEntry", seq_no));
            let commit = log
                .iter()
                .position(|f| *f == Fulfilled::Send("Commit", seq_no));
            assert!(q.unwrap() < prepare.unwrap(), "QEntry({seq_no}) after Prepare");
            assert!(p.unwrap() < commit.unwrap(), "PEntry({seq_no}) after Commit");
        }
    }
}

/// Messages outside the watermark window change nothing.
#[test]
fn out_of_window_messages_do_not_advance_state() {
    let mut cluster = Cluster::new(ClusterConfig::default());
    let before = cluster.nodes[0].sm.status();

    cluster.apply(
        0,
        Event::Step {
            source: NodeId(1),
            msg: Msg::Prepare {
                seq_no: 100,
                epoch: 0,
                digest: sha(&[1]),
            },
        },
    );
    cluster.apply(
        0,
        Event::Step {
            source: NodeId(1),
            msg: Msg::Commit {
                seq_no: 0,
                epoch: 0,
                digest: sha(&[1]),
            },
        },
    );

    let after = cluster.nodes[0].sm.status();
    assert_eq!(before.low_watermark, after.low_watermark);
    assert_eq!(before.high_watermark, after.high_watermark);
    assert_eq!(before.last_committed, after.last_committed);
    assert_eq!(cluster.broadcasts("Prepare"), 0);
    assert_eq!(cluster.broadcasts("Commit"), 0);
}

/// Re-running a recorded event stream through a fresh state machine yields
/// an identical action stream.
#[test]
fn replay_is_deterministic() {
    let mut cluster = Cluster::new(ClusterConfig::default());
    cluster.propose(0, vec![0x01]);
    cluster.deliver_all();
    cluster.tick_all();
    cluster.tick_all();
    cluster.deliver_all();

    let events = cluster.nodes[0].events.clone();
    let dumps = cluster.nodes[0].action_dumps.clone();
    let mut replayed = StateMachine::new();
    for (event, expected) in events.into_iter().zip(dumps) {
        let actions = replayed.apply(event);
        assert_eq!(format!("{actions:?}"), expected);
    }
}

/// Restarting after a QEntry was persisted (but no PEntry) re-enters
/// Preprepared and re-broadcasts the prepare.
#[test]
fn s6_restart_rebroadcasts_prepare() {
    let network = NetworkConfig {
        nodes: vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)],
        number_of_buckets: 4,
        checkpoint_interval: 5,
        epoch_length: 500,
    };
    let network_state = NetworkState {
        config: network,
        clients: vec![0, 1, 2, 3],
    };
    // Request (0, 3) maps to bucket 3, the bucket of sequence 3.
    let request = RequestData {
        client_id: 0,
        req_no: 3,
        data: vec![0x07],
    };
    let digest = batch_digest(std::slice::from_ref(&request));
    let q_entry = QEntry {
        seq_no: 3,
        epoch: 0,
        digest: digest.clone(),
        requests: vec![request],
    };

    let mut sm = StateMachine::new();
    sm.apply(Event::Initialize(InitialParameters {
        id: NodeId(0),
        batch_size: 1,
        heartbeat_ticks: 2,
        suspect_ticks: 4,
        new_epoch_timeout_ticks: 8,
        buffer_size: 500,
    }));
    let mut wal = genesis_entries(&network_state);
    wal.push(Persistent::QEntry(q_entry));
    for (index, entry) in wal.into_iter().enumerate() {
        sm.apply(Event::LoadEntry {
            index: index as u64,
            entry,
        });
    }
    let actions = sm.apply(Event::CompleteInitialization);

    assert!(actions.broadcast.iter().any(|msg| matches!(
        msg,
        Msg::Prepare { seq_no: 3, epoch: 0, digest: d } if *d == digest
    )));

    let status = sm.status();
    let bucket3 = status.buckets.iter().find(|b| b.id == 3).unwrap();
    assert_eq!(bucket3.sequences[0], SequenceState::Preprepared);
}

/// Status snapshots serialize for external diagnostics.
#[test]
fn status_snapshot_serializes() {
    let mut cluster = Cluster::new(ClusterConfig::default());
    cluster.propose(0, vec![0x01]);
    cluster.deliver_all();

    let status = cluster.nodes[0].sm.status();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["id"], 0);
    assert_eq!(json["epoch"], 0);
    assert_eq!(json["low_watermark"], 1);
    assert_eq!(json["buckets"].as_array().unwrap().len(), 4);
}

/// An adversarial prepare under a different digest is tracked separately
/// and never counts toward the quorum for the bound digest.
#[test]
fn s5_conflicting_prepare_does_not_commit() {
    let mut cluster = Cluster::new(ClusterConfig::default());
    cluster.propose(0, vec![0x01]);
    cluster.deliver_all();
    let committed_before = cluster.committed(0).len();

    // A pair of forged prepares for an unallocated slot's bucket leader.
    for _ in 0..2 {
        cluster.apply(
            0,
            Event::Step {
                source: NodeId(2),
                msg: Msg::Prepare {
                    seq_no: 2,
                    epoch: 0,
                    digest: sha(b"forged"),
                },
            },
        );
    }
    cluster.deliver_all();
    assert_eq!(cluster.committed(0).len(), committed_before);
    let status = cluster.nodes[0].sm.status();
    let bucket2 = status.buckets.iter().find(|b| b.id == 2).unwrap();
    assert!(bucket2.sequences[0] < SequenceState::Preprepared);
}
