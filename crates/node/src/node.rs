//! The public node handle.

use crate::serializer::{ExitCell, Serializer};
use crate::wal::{BootstrapWal, WalStorage};
use multibft_core::{ActionResults, Actions, EventInterceptor, InitialParameters};
use multibft_statemachine::StatusSnapshot;
use multibft_types::{
    CEntry, EpochConfig, Msg, NetworkConfig, NetworkState, NodeId, Persistent, SeqNo,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors surfaced by the node API.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// Malformed startup input; nothing was started.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The caller's cancellation handle fired before the hand-off; the
    /// operation was not applied.
    #[error("operation cancelled")]
    Cancelled,
    /// The node was stopped. Terminal.
    #[error("node stopped")]
    Stopped,
    /// The state machine terminated on an internal invariant violation.
    /// Terminal; the last status snapshot is available for diagnosis.
    #[error("node exited: {0}")]
    Exit(String),
}

/// A member of the replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub id: NodeId,
}

/// Node startup options. The six numeric parameters are required by the
/// engine; the rest customize the environment.
pub struct Config {
    pub id: NodeId,
    pub batch_size: u32,
    pub heartbeat_ticks: u32,
    pub suspect_ticks: u32,
    pub new_epoch_timeout_ticks: u32,
    pub buffer_size: u32,
    /// Observes every event before it is applied (replay, logging).
    pub event_interceptor: Option<Box<dyn EventInterceptor>>,
    /// Overrides the network state derived from the replica list.
    pub initial_network_state: Option<NetworkState>,
    /// Existing WAL to restart from; a fresh bootstrap log otherwise.
    pub wal: Option<Box<dyn WalStorage>>,
}

impl Config {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            batch_size: 1,
            heartbeat_ticks: 2,
            suspect_ticks: 4,
            new_epoch_timeout_ticks: 8,
            buffer_size: 500,
            event_interceptor: None,
            initial_network_state: None,
            wal: None,
        }
    }
}

/// Handle to a running replica.
///
/// Cheap to share; all mutating calls cross a channel into the single
/// serializer task. [`Node::ready`] yields action batches — at most one is
/// in flight until the caller consumes it.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    input_tx: mpsc::Sender<Input>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Actions>>,
    done: CancellationToken,
    exit: Arc<Mutex<ExitCell>>,
}

pub(crate) enum Input {
    Step { source: NodeId, msg: Msg },
    Propose { data: Vec<u8> },
    Tick,
    Results(ActionResults),
    Transfer {
        seq_no: SeqNo,
        value: Vec<u8>,
        network_state: NetworkState,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

impl Node {
    /// Start a new replica. Must be called within a tokio runtime.
    ///
    /// `done` stops the node when cancelled (equivalent to [`Node::stop`]);
    /// `replicas` lists the full replica set, this node included.
    pub fn start(
        mut config: Config,
        done: CancellationToken,
        replicas: &[Replica],
    ) -> Result<Node, NodeError> {
        if replicas.is_empty() {
            return Err(NodeError::Config("replica set is empty".into()));
        }
        let mut nodes: Vec<NodeId> = replicas.iter().map(|r| r.id).collect();
        nodes.sort_unstable();
        if nodes.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(NodeError::Config("duplicate replica id".into()));
        }
        if !nodes.contains(&config.id) {
            return Err(NodeError::Config(format!(
                "{} is not in the replica set",
                config.id
            )));
        }
        if config.batch_size == 0 {
            return Err(NodeError::Config("batch size must be at least one".into()));
        }

        let network_state = match config.initial_network_state.take() {
            Some(state) => state,
            None => default_network_state(&nodes),
        };
        network_state
            .config
            .validate()
            .map_err(|err| NodeError::Config(err.to_string()))?;

        let wal: Box<dyn WalStorage> = match config.wal.take() {
            Some(wal) => wal,
            None => Box::new(bootstrap_wal(network_state.clone())),
        };

        let params = InitialParameters {
            id: config.id,
            batch_size: config.batch_size,
            heartbeat_ticks: config.heartbeat_ticks,
            suspect_ticks: config.suspect_ticks,
            new_epoch_timeout_ticks: config.new_epoch_timeout_ticks,
            buffer_size: config.buffer_size,
        };

        let (input_tx, input_rx) = mpsc::channel(1024);
        // One-deep: at most a single batch awaits the caller.
        let (actions_tx, ready_rx) = mpsc::channel(1);
        let exit = Arc::new(Mutex::new(ExitCell::default()));

        let serializer = Serializer::new(
            params,
            config.event_interceptor.take(),
            input_rx,
            actions_tx,
            done.clone(),
            exit.clone(),
        );
        tokio::spawn(serializer.run(wal));
        info!(node = config.id.0, replicas = replicas.len(), "node started");

        Ok(Node {
            id: config.id,
            input_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            done,
            exit,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Submit a client payload for ordering.
    pub async fn propose(&self, ctx: &CancellationToken, data: Vec<u8>) -> Result<(), NodeError> {
        self.submit(Some(ctx), Input::Propose { data }).await
    }

    /// Deliver a protocol message from another replica.
    pub async fn step(
        &self,
        ctx: &CancellationToken,
        source: NodeId,
        msg: Msg,
    ) -> Result<(), NodeError> {
        self.submit(Some(ctx), Input::Step { source, msg }).await
    }

    /// Advance the engine's logical clock by one tick.
    pub async fn tick(&self) -> Result<(), NodeError> {
        self.submit(None, Input::Tick).await
    }

    /// Return completions for previously delivered actions.
    pub async fn add_results(&self, results: ActionResults) -> Result<(), NodeError> {
        self.submit(None, Input::Results(results)).await
    }

    /// Install an externally obtained checkpoint (state transfer).
    pub async fn state_transfer(
        &self,
        ctx: &CancellationToken,
        seq_no: SeqNo,
        value: Vec<u8>,
        network_state: NetworkState,
    ) -> Result<(), NodeError> {
        self.submit(
            Some(ctx),
            Input::Transfer {
                seq_no,
                value,
                network_state,
            },
        )
        .await
    }

    /// Receive the next batch of actions. The engine produces at most one
    /// batch until it is consumed here.
    pub async fn ready(&self, ctx: &CancellationToken) -> Result<Actions, NodeError> {
        if self.done.is_cancelled() {
            return Err(self.terminal_error());
        }
        if ctx.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        let mut ready_rx = self.ready_rx.lock().await;
        tokio::select! {
            batch = ready_rx.recv() => batch.ok_or_else(|| self.terminal_error()),
            _ = ctx.cancelled() => Err(NodeError::Cancelled),
            _ = self.done.cancelled() => Err(self.terminal_error()),
        }
    }

    /// Snapshot the state machine's status.
    pub async fn status(&self, ctx: &CancellationToken) -> Result<StatusSnapshot, NodeError> {
        let (reply, response) = oneshot::channel();
        self.submit(Some(ctx), Input::Status { reply }).await?;
        tokio::select! {
            status = response => status.map_err(|_| self.terminal_error()),
            _ = ctx.cancelled() => Err(NodeError::Cancelled),
            _ = self.done.cancelled() => Err(self.terminal_error()),
        }
    }

    /// Stop the node. Idempotent.
    pub fn stop(&self) {
        self.done.cancel();
    }

    /// The terminal error, once the serializer has exited.
    pub fn exit_err(&self) -> Option<NodeError> {
        self.exit.lock().error.clone()
    }

    /// The final status snapshot captured at exit, for diagnosis.
    pub fn exit_status(&self) -> Option<StatusSnapshot> {
        self.exit.lock().status.clone()
    }

    async fn submit(&self, ctx: Option<&CancellationToken>, input: Input) -> Result<(), NodeError> {
        if self.done.is_cancelled() {
            return Err(self.terminal_error());
        }
        if ctx.is_some_and(|ctx| ctx.is_cancelled()) {
            return Err(NodeError::Cancelled);
        }
        let send = self.input_tx.send(input);
        match ctx {
            Some(ctx) => tokio::select! {
                result = send => result.map_err(|_| self.terminal_error()),
                _ = ctx.cancelled() => Err(NodeError::Cancelled),
                _ = self.done.cancelled() => Err(self.terminal_error()),
            },
            None => tokio::select! {
                result = send => result.map_err(|_| self.terminal_error()),
                _ = self.done.cancelled() => Err(self.terminal_error()),
            },
        }
    }

    fn terminal_error(&self) -> NodeError {
        self.exit_err().unwrap_or(NodeError::Stopped)
    }
}

/// Derive the default network state from a replica set: one bucket and one
/// client per replica, checkpoints every five sequence numbers.
fn default_network_state(nodes: &[NodeId]) -> NetworkState {
    let checkpoint_interval = 5;
    NetworkState {
        config: NetworkConfig {
            nodes: nodes.to_vec(),
            number_of_buckets: nodes.len() as u64,
            checkpoint_interval,
            epoch_length: checkpoint_interval * 100,
        },
        clients: nodes.iter().map(|n| n.0).collect(),
    }
}

/// The genesis log for a fresh start: a checkpoint at sequence zero plus
/// the epoch-zero start record.
fn bootstrap_wal(network_state: NetworkState) -> BootstrapWal {
    let epoch_config = EpochConfig {
        number: 0,
        leaders: network_state.config.nodes.clone(),
        planned_expiration: network_state.config.epoch_length,
    };
    BootstrapWal::new(vec![
        Persistent::CEntry(CEntry {
            seq_no: 0,
            value: Vec::new(),
            network_state,
            epoch_config: epoch_config.clone(),
        }),
        Persistent::NewEpochStart(epoch_config),
    ])
}
