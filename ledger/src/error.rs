//! Errors surfaced to callers of the orchestrator's foreground operations.
//!
//! Background replication never produces one of these: tier failures are
//! logged and recorded in tier health instead.

use thiserror::Error;

use crate::chain::{ChainError, IntegrityError};
use crate::codec::SnapshotError;
use crate::orchestrator::LedgerState;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger is {0}, not active")]
    NotActive(LedgerState),

    #[error("cannot restore: ledger is already {0}")]
    AlreadyStarted(LedgerState),

    #[error("chain invariant violated: {0}")]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("local snapshot write failed: {0}")]
    LocalStore(#[source] std::io::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
