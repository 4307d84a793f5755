//! Write-ahead-log storage interface.
//!
//! The engine never writes the WAL itself: it emits persistence actions and
//! the caller appends them, in the documented order, with whatever storage
//! it owns. On startup the node replays the WAL through [`WalStorage`].

use multibft_types::Persistent;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("corrupt WAL: {0}")]
    Corrupt(String),
    #[error("WAL unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the write-ahead log at startup.
pub trait WalStorage: Send {
    /// Invoke `apply` for every `(index, record)` pair, in index order.
    fn load_all(&self, apply: &mut dyn FnMut(u64, Persistent)) -> Result<(), WalError>;

    /// Whether this is a synthetic bootstrap log whose entries still need to
    /// be written to real storage.
    fn is_bootstrap(&self) -> bool {
        false
    }
}

/// The synthetic WAL used for a fresh start: holds the genesis checkpoint
/// and epoch start, which the node re-emits as persistence actions so they
/// reach the caller's real log.
pub struct BootstrapWal {
    entries: Vec<(u64, Persistent)>,
}

impl BootstrapWal {
    pub fn new(entries: Vec<Persistent>) -> Self {
        Self {
            entries: entries.into_iter().enumerate().map(|(i, e)| (i as u64, e)).collect(),
        }
    }
}

impl WalStorage for BootstrapWal {
    fn load_all(&self, apply: &mut dyn FnMut(u64, Persistent)) -> Result<(), WalError> {
        for (index, entry) in &self.entries {
            apply(*index, entry.clone());
        }
        Ok(())
    }

    fn is_bootstrap(&self) -> bool {
        true
    }
}

/// A WAL kept in memory. Useful in tests and as the reference
/// implementation of the append discipline.
#[derive(Default)]
pub struct MemoryWal {
    pub entries: Vec<(u64, Persistent)>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record with the next index.
    pub fn append(&mut self, entry: Persistent) {
        let index = self.entries.last().map(|(i, _)| i + 1).unwrap_or(0);
        self.entries.push((index, entry));
    }
}

impl WalStorage for MemoryWal {
    fn load_all(&self, apply: &mut dyn FnMut(u64, Persistent)) -> Result<(), WalError> {
        for (index, entry) in &self.entries {
            apply(*index, entry.clone());
        }
        Ok(())
    }
}
