//! Event and action model for the multibft consensus engine.
//!
//! The engine is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::apply() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no `.await`
//! - **Deterministic**: same state + event = same actions
//! - **Pure-ish**: mutates itself, but performs no I/O
//!
//! All I/O, hashing and persistence are handled by the caller, which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Feeds completion results back as further events

mod actions;
mod event;
mod interceptor;

pub use actions::{
    ActionResults, Actions, Batch, CheckpointResult, Commit, PreprocessResult, ProcessResult,
    Request, Unicast,
};
pub use event::{Event, InitialParameters};
pub use interceptor::{EventInterceptor, InterceptError};
