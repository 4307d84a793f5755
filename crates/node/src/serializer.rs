//! The serializer: the single task that drives the state machine.
//!
//! Strictly sequential: one event at a time, in arrival order. When the
//! pending accumulator is non-empty the loop also races to publish it on
//! the one-deep actions channel; a successful publication immediately
//! applies `ActionsReceived`. Panics from the state machine (protocol-fatal
//! invariant violations) are trapped, converted into the terminal exit
//! error, and the final status snapshot is parked for diagnosis.

use crate::node::{Input, NodeError};
use crate::wal::WalStorage;
use multibft_core::{Actions, Event, EventInterceptor, InitialParameters};
use multibft_statemachine::{StateMachine, StatusSnapshot};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Terminal outcome of the serializer, read through `Node::exit_err`.
#[derive(Debug, Default)]
pub(crate) struct ExitCell {
    pub(crate) error: Option<NodeError>,
    pub(crate) status: Option<StatusSnapshot>,
}

pub(crate) struct Serializer {
    sm: StateMachine,
    params: InitialParameters,
    interceptor: Option<Box<dyn EventInterceptor>>,
    actions: Actions,
    input_rx: mpsc::Receiver<Input>,
    actions_tx: mpsc::Sender<Actions>,
    done: CancellationToken,
    exit: Arc<Mutex<ExitCell>>,
}

impl Serializer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        params: InitialParameters,
        interceptor: Option<Box<dyn EventInterceptor>>,
        input_rx: mpsc::Receiver<Input>,
        actions_tx: mpsc::Sender<Actions>,
        done: CancellationToken,
        exit: Arc<Mutex<ExitCell>>,
    ) -> Self {
        Self {
            sm: StateMachine::new(),
            params,
            interceptor,
            actions: Actions::default(),
            input_rx,
            actions_tx,
            done,
            exit,
        }
    }

    pub(crate) async fn run(mut self, wal: Box<dyn WalStorage>) {
        let result = self.run_inner(wal).await;
        let error = result.expect_err("serializer loop only returns on error");
        if !matches!(error, NodeError::Stopped) {
            error!(node = self.params.id.0, %error, "serializer terminated");
        }
        let status = std::panic::catch_unwind(AssertUnwindSafe(|| self.sm.status())).ok();
        let mut exit = self.exit.lock();
        exit.error = Some(error);
        exit.status = status;
        // Wake every pending caller.
        self.done.cancel();
    }

    async fn run_inner(&mut self, wal: Box<dyn WalStorage>) -> Result<(), NodeError> {
        self.apply(Event::Initialize(self.params.clone()))?;

        let mut entries = Vec::new();
        wal.load_all(&mut |index, entry| entries.push((index, entry)))
            .map_err(|err| NodeError::Config(err.to_string()))?;
        for (index, entry) in entries {
            if wal.is_bootstrap() {
                // A fresh start replays the synthetic bootstrap log; its
                // entries must reach the caller's real WAL.
                self.actions.persisted.push(entry.clone());
            }
            self.apply(Event::LoadEntry { index, entry })?;
        }

        self.apply(Event::CompleteInitialization)?;

        loop {
            let actions_tx = self.actions_tx.clone();
            tokio::select! {
                biased;

                _ = self.done.cancelled() => return Err(NodeError::Stopped),

                permit = actions_tx.reserve(), if !self.actions.is_empty() => {
                    let Ok(permit) = permit else {
                        return Err(NodeError::Stopped);
                    };
                    permit.send(std::mem::take(&mut self.actions));
                    self.apply(Event::ActionsReceived)?;
                }

                input = self.input_rx.recv() => {
                    let Some(input) = input else {
                        return Err(NodeError::Stopped);
                    };
                    match input {
                        Input::Step { source, msg } => {
                            self.apply(Event::Step { source, msg })?;
                        }
                        Input::Propose { data } => {
                            self.apply(Event::Propose { data })?;
                        }
                        Input::Tick => self.apply(Event::Tick)?,
                        Input::Results(results) => {
                            self.apply(Event::AddResults(results))?;
                        }
                        Input::Transfer { seq_no, value, network_state } => {
                            self.apply(Event::StateTransfer { seq_no, value, network_state })?;
                        }
                        Input::Status { reply } => {
                            let _ = reply.send(self.sm.status());
                        }
                    }
                }
            }
        }
    }

    /// Intercept, apply, accumulate. A state-machine panic becomes the
    /// terminal exit error.
    fn apply(&mut self, event: Event) -> Result<(), NodeError> {
        if let Some(interceptor) = &mut self.interceptor {
            interceptor
                .intercept(&event)
                .map_err(|err| NodeError::Exit(err.to_string()))?;
        }
        let kind = event.type_name();
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.sm.apply(event))) {
            Ok(actions) => {
                self.actions.append(actions);
                Ok(())
            }
            Err(panic) => {
                let message = panic_message(&panic);
                debug!(node = self.params.id.0, event = kind, message = %message, "state machine panicked");
                Err(NodeError::Exit(format!(
                    "state machine panicked applying {kind}: {message}"
                )))
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
