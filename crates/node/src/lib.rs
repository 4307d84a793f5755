//! Async node wrapper around the multibft state machine.
//!
//! The state machine itself is synchronous and single-threaded; this crate
//! provides the *serializer* — the one task allowed to mutate it — and the
//! [`Node`] handle callers use from arbitrary tasks. Calls cross a channel
//! into the serializer, which interleaves them with the publication of
//! pending action batches on a one-deep ready stream.
//!
//! ```text
//! Propose/Step/Tick/AddResults ──channel──▶ serializer ──▶ StateMachine
//!                                              │
//! Ready() ◀──────one-deep actions channel──────┘
//! ```

mod node;
mod serializer;
mod wal;

pub use node::{Config, Node, NodeError, Replica};
pub use wal::{BootstrapWal, MemoryWal, WalError, WalStorage};
