//! Event interception for deterministic replay.

use crate::Event;
use thiserror::Error;

/// Error returned by an [`EventInterceptor`]; terminates the event loop.
#[derive(Debug, Clone, Error)]
#[error("event interceptor: {0}")]
pub struct InterceptError(pub String);

/// Observes every event immediately before it is applied to the state
/// machine.
///
/// Because the state machine is deterministic, recording the event stream is
/// sufficient to reproduce the exact action stream later. Interceptors are
/// also the natural place for structured event logging.
pub trait EventInterceptor: Send {
    /// Called before `event` is applied. Returning an error terminates the
    /// replica with that error.
    fn intercept(&mut self, event: &Event) -> Result<(), InterceptError>;
}

impl<F> EventInterceptor for F
where
    F: FnMut(&Event) -> Result<(), InterceptError> + Send,
{
    fn intercept(&mut self, event: &Event) -> Result<(), InterceptError> {
        self(event)
    }
}
