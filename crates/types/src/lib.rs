//! Core types for the multibft consensus engine.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Identifiers**: [`NodeId`], [`BucketId`], sequence/epoch numbers, [`Digest`]
//! - **Configuration**: [`NetworkConfig`], [`NetworkState`], [`EpochConfig`]
//! - **Wire taxonomy**: [`Msg`] and its payload types
//! - **Persistence taxonomy**: [`Persistent`] and the WAL record types
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. Notably it
//! defines *no* cryptography: a [`Digest`] is whatever byte string the caller
//! computed, and the engine only ever compares digests for equality.

mod config;
mod identifiers;
mod message;
mod persistent;
mod request;

pub use config::{ConfigError, EpochConfig, NetworkConfig, NetworkState};
pub use identifiers::{BucketId, ClientId, Digest, EpochNo, NodeId, ReqNo, SeqNo};
pub use message::{EntryRef, EpochChange, Msg, NewEpoch};
pub use persistent::{CEntry, PEntry, Persistent, QEntry};
pub use request::{RequestAck, RequestData};
