//! Deterministic multi-leader BFT protocol state machine.
//!
//! This crate implements the protocol core: a single-threaded, synchronous
//! state machine replicating a request log across `N` replicas while
//! tolerating `f = (N-1)/3` Byzantine faults. Proposal authority is
//! partitioned across *buckets*, each led by a different replica in the
//! current epoch, so throughput scales with the number of correct leaders.
//!
//! The entry point is [`StateMachine`]: feed it [`multibft_core::Event`]s,
//! execute the [`multibft_core::Actions`] it returns, feed completions back.
//! It performs no I/O, no hashing and no clock reads, which makes every run
//! exactly replayable from its event stream.
//!
//! Internal structure follows the protocol:
//!
//! - `sequence` — the three-phase state machine for one log slot
//! - `client` — per-client request windows and attestation tracking
//! - `proposer` — drains attested requests into per-bucket batches
//! - `outstanding` — resolves requests referenced by foreign preprepares
//! - `epoch_active` — the sequence window of the current epoch
//! - `checkpoints` — checkpoint quorums and watermark movement
//! - `epoch_tracker` — suspicion, epoch change, and epoch activation
//! - `persisted` — in-memory mirror of the caller's write-ahead log

mod buckets;
mod buffer;
mod checkpoints;
mod client;
mod epoch_active;
mod epoch_tracker;
mod outstanding;
mod persisted;
mod proposer;
mod sequence;
mod state_machine;
mod status;

pub use sequence::SequenceState;
pub use state_machine::StateMachine;
pub use status::{BucketStatus, ClientStatus, EpochPhase, StatusSnapshot};
