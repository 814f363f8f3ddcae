//! # Chain
//!
//! Blocks, their canonical hashing, proof-of-work mining, and the
//! [`HashChain`] that holds them.
//!
//! ```text
//! ┌─────────┐   ┌─────────┐   ┌─────────┐
//! │ block 0 │◄──│ block 1 │◄──│ block 2 │  previous_hash links
//! │ genesis │   │  add    │   │transfer │
//! └─────────┘   └─────────┘   └─────────┘
//! ```

pub mod block;
pub mod canonical;
pub mod ledger;
pub mod state;
pub mod validation;

pub use block::{Block, NonceSpaceExhausted};
pub use ledger::{ChainError, ChainInfo, HashChain};
pub use state::CurrentState;
pub use validation::{Diagnostic, DiagnosticKind, IntegrityError};
