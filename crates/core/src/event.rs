//! Event types for the deterministic state machine.

use crate::ActionResults;
use multibft_types::{Msg, NetworkState, NodeId, Persistent, SeqNo};

/// Startup parameters for a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialParameters {
    /// This replica's id.
    pub id: NodeId,
    /// Number of requests per full batch.
    pub batch_size: u32,
    /// Heartbeat every this many stalled ticks (0 disables heartbeats).
    pub heartbeat_ticks: u32,
    /// Suspect the epoch after this many ticks without commit progress.
    pub suspect_ticks: u32,
    /// Suspect a pending epoch after this many ticks without activation.
    pub new_epoch_timeout_ticks: u32,
    /// Per-peer cap on buffered not-yet-applicable messages.
    pub buffer_size: u32,
}

/// All possible inputs to the state machine.
///
/// Events are **passive data** — they describe something that happened. The
/// state machine processes events and returns actions.
///
/// The first three variants form the mandatory initialization sequence:
/// [`Event::Initialize`], then one [`Event::LoadEntry`] per WAL record in
/// order, then [`Event::CompleteInitialization`].
#[derive(Debug, Clone)]
pub enum Event {
    /// Configure the replica. Must be the first event applied.
    Initialize(InitialParameters),

    /// Replay one persisted WAL record.
    LoadEntry { index: u64, entry: Persistent },

    /// WAL replay is complete; reconstruct runtime state and resume.
    CompleteInitialization,

    /// A protocol message arrived from `source`.
    Step { source: NodeId, msg: Msg },

    /// The local client submits a request payload for ordering.
    Propose { data: Vec<u8> },

    /// One tick of the caller's clock elapsed.
    Tick,

    /// The caller completed previously requested actions.
    AddResults(ActionResults),

    /// The caller installed an externally obtained checkpoint (state
    /// transfer), letting a lagging replica rejoin the majority.
    StateTransfer {
        seq_no: SeqNo,
        value: Vec<u8>,
        network_state: NetworkState,
    },

    /// The previously returned actions batch was handed to the caller.
    ActionsReceived,
}

impl Event {
    /// Get the event type name for log labels.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Initialize(_) => "Initialize",
            Event::LoadEntry { .. } => "LoadEntry",
            Event::CompleteInitialization => "CompleteInitialization",
            Event::Step { .. } => "Step",
            Event::Propose { .. } => "Propose",
            Event::Tick => "Tick",
            Event::AddResults(_) => "AddResults",
            Event::StateTransfer { .. } => "StateTransfer",
            Event::ActionsReceived => "ActionsReceived",
        }
    }
}
