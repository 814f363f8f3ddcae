// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # deedchain
//!
//! An append-only, hash-linked ledger of property records that survives
//! ephemeral hosting. The chain lives in memory; every append is sealed into
//! an encrypted snapshot and pushed to up to three storage tiers, and a small
//! set of pointer sinks remembers where the newest content-addressed copy is.
//!
//! ## Layout
//!
//! - **chain**: blocks, hashing, proof of work, validation and the per-key
//!   state fold. Pure and synchronous.
//! - **codec**: snapshot serialization and sealing.
//! - **tiers**: local file, relational backup table, content-addressed
//!   store. One async contract for all three.
//! - **pointer**: the latest-CID registry: control plane, blob tag, note
//!   store, local file.
//! - **orchestrator**: restore priority, the append write path, background
//!   replication and the bounded shutdown backup.
//! - **crypto** / **config**: primitives and constants.
//!
//! ## Durability Contract
//!
//! `append` returns once the local snapshot holds the new block. Everything
//! past the local file is best effort and is reported through tier health,
//! never through the append result.

pub mod chain;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod orchestrator;
pub mod pointer;
pub mod tiers;

pub use chain::{Block, ChainInfo, CurrentState, Diagnostic, DiagnosticKind, HashChain};
pub use codec::{SnapshotCodec, SnapshotDocument, SnapshotError};
pub use error::{LedgerError, LedgerResult};
pub use orchestrator::{
    LedgerState, Orchestrator, OrchestratorConfig, RestoreOutcome, RestoreSource, ShutdownReport,
    TierHealth, Tiers,
};
